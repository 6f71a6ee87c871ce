//! Observer bus, the per-datastore event stream.
//!
//! Events are emitted only for committed transactions, in commit order.
//! Each observer buffers independently under its own policy; a slow
//! observer never raises into the committing writer, it drops events per
//! policy instead.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, Weak},
    time,
};

/// Instance level event on one datastore.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Event {
    Created {
        identifier: Vec<u8>,
        entry: Option<Vec<u8>>,
    },
    Updated {
        identifier: Vec<u8>,
        entry: Option<Vec<u8>>,
    },
    Deleted {
        identifier: Vec<u8>,
    },
    IndexAdded {
        name: String,
    },
    IndexRemoved {
        name: String,
    },
}

/// How an observer buffers events it has not consumed yet.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum BufferingPolicy {
    /// Buffer everything.
    Unbounded,
    /// Keep the oldest `n` unconsumed events, drop newer ones.
    BufferingOldest(usize),
    /// Keep the newest `n` unconsumed events, evict older ones.
    BufferingNewest(usize),
}

struct ObserverBuf {
    events: VecDeque<Event>,
    closed: bool,
    n_dropped: usize,
}

struct ObserverInner {
    policy: BufferingPolicy,
    mu: Mutex<ObserverBuf>,
    cv: Condvar,
}

/// Receiving side of a datastore's event stream.
pub struct Observer {
    inner: Arc<ObserverInner>,
}

impl Observer {
    /// Wait for the next event. Returns None once the bus is closed and
    /// the buffer is drained.
    pub fn recv(&self) -> Option<Event> {
        let mut buf = self.inner.mu.lock().unwrap();
        loop {
            if let Some(event) = buf.events.pop_front() {
                return Some(event);
            }
            if buf.closed {
                return None;
            }
            buf = self.inner.cv.wait(buf).unwrap();
        }
    }

    /// Like [Observer::recv] bounded by `timeout`.
    pub fn recv_timeout(&self, timeout: time::Duration) -> Option<Event> {
        let deadline = time::Instant::now() + timeout;
        let mut buf = self.inner.mu.lock().unwrap();
        loop {
            if let Some(event) = buf.events.pop_front() {
                return Some(event);
            }
            if buf.closed {
                return None;
            }
            let now = time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, res) = self.inner.cv.wait_timeout(buf, deadline - now).unwrap();
            buf = next;
            if res.timed_out() && buf.events.is_empty() {
                return None;
            }
        }
    }

    /// Drain whatever is buffered right now.
    pub fn drain(&self) -> Vec<Event> {
        let mut buf = self.inner.mu.lock().unwrap();
        buf.events.drain(..).collect()
    }

    /// Number of events dropped so far under this observer's policy.
    pub fn to_dropped(&self) -> usize {
        self.inner.mu.lock().unwrap().n_dropped
    }
}

impl Iterator for Observer {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.recv()
    }
}

/// Publishing side, owned by the datastore. Observers are held weakly,
/// dropping an [Observer] unsubscribes it.
pub struct ObserverBus {
    observers: Mutex<Vec<Weak<ObserverInner>>>,
}

impl Default for ObserverBus {
    fn default() -> ObserverBus {
        ObserverBus {
            observers: Mutex::new(vec![]),
        }
    }
}

impl ObserverBus {
    pub fn subscribe(&self, policy: BufferingPolicy) -> Observer {
        let inner = Arc::new(ObserverInner {
            policy,
            mu: Mutex::new(ObserverBuf {
                events: VecDeque::new(),
                closed: false,
                n_dropped: 0,
            }),
            cv: Condvar::new(),
        });
        let mut observers = self.observers.lock().unwrap();
        observers.push(Arc::downgrade(&inner));
        Observer { inner }
    }

    /// Publish committed events, in order, to every live observer.
    pub fn publish(&self, events: &[Event]) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|weak| match weak.upgrade() {
            Some(inner) => {
                let mut buf = inner.mu.lock().unwrap();
                for event in events.iter() {
                    match inner.policy {
                        BufferingPolicy::Unbounded => buf.events.push_back(event.clone()),
                        BufferingPolicy::BufferingOldest(n) => {
                            match buf.events.len() < n {
                                true => buf.events.push_back(event.clone()),
                                false => buf.n_dropped += 1,
                            }
                        }
                        BufferingPolicy::BufferingNewest(n) if n == 0 => {
                            buf.n_dropped += 1
                        }
                        BufferingPolicy::BufferingNewest(n) => {
                            while buf.events.len() >= n {
                                buf.events.pop_front();
                                buf.n_dropped += 1;
                            }
                            buf.events.push_back(event.clone());
                        }
                    }
                }
                inner.cv.notify_all();
                true
            }
            None => false,
        });
    }

    /// Terminate every stream; observers drain their buffers and then
    /// see end-of-stream.
    pub fn close(&self) {
        let observers = self.observers.lock().unwrap();
        for weak in observers.iter() {
            if let Some(inner) = weak.upgrade() {
                inner.mu.lock().unwrap().closed = true;
                inner.cv.notify_all();
            }
        }
    }
}

#[cfg(test)]
#[path = "observer_test.rs"]
mod observer_test;
