use rand::prelude::random;

use std::{env, path, sync::Mutex};

use crate::{
    persist::{Config, Persistence},
    store::{Descriptor, IndexDescriptor},
};

use super::*;

fn scratch_config(name: &str) -> Config {
    let mut dir = env::temp_dir();
    dir.push(format!("cowdb-{}-{:x}", name, random::<u64>()));
    Config::new(dir.as_os_str())
}

fn cleanup(p: Persistence) {
    let dir = p.as_dir().to_os_string();
    p.close().unwrap();
    std::fs::remove_dir_all(path::Path::new(&dir)).ok();
}

fn items_descriptor() -> Descriptor {
    let mut descriptor = Descriptor::new("v1", "Item", "String");
    descriptor.add_direct_index(IndexDescriptor::new("title", "String", "v1"));
    descriptor
}

#[test]
fn test_cursor_insert_lookup_delete() {
    let p = Persistence::open(scratch_config("txn-cursors")).unwrap();
    let key = p.register("Items", items_descriptor()).unwrap();

    p.transact(Some("insert"), |txn| {
        let at = txn.primary_insertion_cursor(&key, b"a")?;
        txn.insert_primary_entry(&key, at, b"v1", b"a", b"first")?;

        // the key now exists, an insertion cursor is refused.
        match txn.primary_insertion_cursor(&key, b"a") {
            Err(Error::InstanceAlreadyExists(_, _)) => (),
            other => panic!("{:?}", other.map(|_| ())),
        }

        let cursor = txn.primary_lookup_cursor(&key, b"a")?;
        txn.replace_primary_entry(&key, cursor, b"v1", b"a", b"second")?;
        assert_eq!(txn.load_primary_entry(&key, b"a")?, b"second".to_vec());

        let cursor = txn.primary_lookup_cursor(&key, b"a")?;
        txn.delete_primary_entry(&key, cursor)?;
        match txn.primary_lookup_cursor(&key, b"a") {
            Err(Error::InstanceNotFound(_, _)) => Ok(()),
            other => panic!("{:?}", other.map(|_| ())),
        }
    })
    .unwrap();

    cleanup(p);
}

#[test]
fn test_cursor_stale_across_transactions() {
    let p = Persistence::open(scratch_config("txn-stale")).unwrap();
    let key = p.register("Items", items_descriptor()).unwrap();

    let escaped = Mutex::new(None);
    p.transact(Some("first"), |txn| {
        *escaped.lock().unwrap() = Some(txn.primary_insertion_cursor(&key, b"a")?);
        Ok(())
    })
    .unwrap();

    // a cursor from an earlier transaction is stale in a later one.
    let cursor = escaped.lock().unwrap().take().unwrap();
    let res: Result<()> = p.transact(Some("second"), |txn| {
        txn.insert_primary_entry(&key, cursor, b"v1", b"a", b"x")
    });
    match res {
        Err(Error::StaleCursor(_, _)) => (),
        other => panic!("{:?}", other),
    }

    cleanup(p);
}

#[test]
fn test_cursor_consumed_and_epoch() {
    let p = Persistence::open(scratch_config("txn-consumed")).unwrap();
    let key = p.register("Items", items_descriptor()).unwrap();

    p.transact(Some("insert"), |txn| {
        let at = txn.primary_insertion_cursor(&key, b"a")?;
        let copy = at.clone();
        txn.insert_primary_entry(&key, at, b"v1", b"a", b"x")?;

        // consuming a cursor twice is a staleness violation.
        match txn.insert_primary_entry(&key, copy, b"v1", b"a", b"x") {
            Err(Error::StaleCursor(_, _)) => (),
            other => panic!("{:?}", other),
        }

        // a cursor taken before an unrelated mutation of the same index
        // is stale as well.
        let before = txn.primary_insertion_cursor(&key, b"b")?;
        txn.persist_primary_entry(&key, b"v1", b"c", b"y")?;
        match txn.insert_primary_entry(&key, before, b"v1", b"b", b"z") {
            Err(Error::StaleCursor(_, _)) => Ok(()),
            other => panic!("{:?}", other),
        }
    })
    .unwrap();

    cleanup(p);
}

#[test]
fn test_cursor_foreign_persistence() {
    let p1 = Persistence::open(scratch_config("txn-foreign-1")).unwrap();
    let p2 = Persistence::open(scratch_config("txn-foreign-2")).unwrap();
    let key1 = p1.register("Items", items_descriptor()).unwrap();
    let key2 = p2.register("Items", items_descriptor()).unwrap();

    // a key from another persistence is refused outright.
    let res: Result<()> =
        p2.transact(None, |txn| txn.persist_primary_entry(&key1, b"v1", b"a", b"x"));
    match res {
        Err(Error::WrongPersistence(_, _)) => (),
        other => panic!("{:?}", other),
    }

    // a cursor from another persistence is unknown.
    let escaped = Mutex::new(None);
    p1.transact(None, |txn| {
        *escaped.lock().unwrap() = Some(txn.primary_insertion_cursor(&key1, b"a")?);
        Ok(())
    })
    .unwrap();
    let cursor = escaped.lock().unwrap().take().unwrap();
    let res: Result<()> = p2.transact(None, |txn| {
        txn.insert_primary_entry(&key2, cursor, b"v1", b"a", b"x")
    });
    match res {
        Err(Error::UnknownCursor(_, _)) => (),
        other => panic!("{:?}", other),
    }

    cleanup(p1);
    cleanup(p2);
}

#[test]
fn test_readonly_cannot_write() {
    let p = Persistence::open(scratch_config("txn-readonly")).unwrap();
    let key = p.register("Items", items_descriptor()).unwrap();
    p.transact(None, |txn| txn.persist_primary_entry(&key, b"v1", b"a", b"x"))
        .unwrap();

    let res: Result<()> =
        p.read(|txn| txn.persist_primary_entry(&key, b"v1", b"b", b"y"));
    match res {
        Err(Error::CannotWrite(_, _)) => (),
        other => panic!("{:?}", other),
    }

    cleanup(p);
}

#[test]
fn test_child_transaction_shares_working_copy() {
    let p = Persistence::open(scratch_config("txn-child")).unwrap();
    let key = p.register("Items", items_descriptor()).unwrap();

    p.transact(Some("parent"), |txn| {
        txn.persist_primary_entry(&key, b"v1", b"parent", b"x")?;

        // the child attaches to the parent and sees its writes.
        p.transact(Some("child"), |child| {
            assert_eq!(child.load_primary_entry(&key, b"parent")?, b"x".to_vec());
            child.persist_primary_entry(&key, b"v1", b"child", b"y")
        })?;

        // and the parent sees the child's.
        assert_eq!(txn.load_primary_entry(&key, b"child")?, b"y".to_vec());
        Ok(())
    })
    .unwrap();

    // one commit for the whole family.
    assert_eq!(p.to_stats().unwrap().n_iterations, 2);
    p.read(|txn| {
        assert_eq!(txn.load_primary_entry(&key, b"child")?, b"y".to_vec());
        Ok(())
    })
    .unwrap();

    cleanup(p);
}

#[test]
fn test_readonly_parent_refuses_write_child() {
    let p = Persistence::open(scratch_config("txn-ro-child")).unwrap();
    let key = p.register("Items", items_descriptor()).unwrap();
    p.transact(None, |txn| txn.persist_primary_entry(&key, b"v1", b"a", b"x"))
        .unwrap();

    let res: Result<()> = p.read(|_txn| {
        p.transact(None, |child| {
            child.persist_primary_entry(&key, b"v1", b"b", b"y")
        })
    });
    match res {
        Err(Error::CannotWrite(_, _)) => (),
        other => panic!("{:?}", other),
    }

    cleanup(p);
}

#[test]
fn test_transacting_within_external_persistence() {
    let p1 = Persistence::open(scratch_config("txn-ext-1")).unwrap();
    let p2 = Persistence::open(scratch_config("txn-ext-2")).unwrap();
    let key1 = p1.register("Items", items_descriptor()).unwrap();
    let key2 = p2.register("Items", items_descriptor()).unwrap();
    p2.transact(None, |txn| txn.persist_primary_entry(&key2, b"v1", b"b", b"y"))
        .unwrap();

    let res: Result<()> = p1.transact(None, |txn| {
        txn.persist_primary_entry(&key1, b"v1", b"a", b"x")?;
        // a write on another persistence inside this one is refused...
        p2.transact(None, |inner| {
            inner.persist_primary_entry(&key2, b"v1", b"c", b"z")
        })
    });
    match res {
        Err(Error::TransactingWithinExternalPersistence(_, _)) => (),
        other => panic!("{:?}", other),
    }

    // ... but a read-only transaction on it is fine.
    p1.transact(None, |txn| {
        txn.persist_primary_entry(&key1, b"v1", b"a", b"x")?;
        p2.read(|inner| {
            assert_eq!(inner.load_primary_entry(&key2, b"b")?, b"y".to_vec());
            Ok(())
        })
    })
    .unwrap();

    cleanup(p1);
    cleanup(p2);
}

#[test]
fn test_scan_backpressure_stop() {
    let p = Persistence::open(scratch_config("txn-scan-stop")).unwrap();
    let key = p.register("Items", items_descriptor()).unwrap();

    p.transact(None, |txn| {
        for n in 0..100_u32 {
            let id = format!("{:04}", n);
            txn.persist_primary_entry(&key, b"v1", id.as_bytes(), b"x")?;
        }
        Ok(())
    })
    .unwrap();

    // the consumer drives the scan and can stop it early.
    let seen = Mutex::new(0_usize);
    p.read(|txn| {
        txn.primary_index_scan(
            &key,
            ScanBound::Extent,
            ScanBound::Extent,
            ScanOrder::Ascending,
            |_item| {
                let mut seen = seen.lock().unwrap();
                *seen += 1;
                Ok(*seen < 10)
            },
        )
    })
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), 10);

    cleanup(p);
}

#[test]
fn test_primary_scan_descending() {
    let p = Persistence::open(scratch_config("txn-scan-desc")).unwrap();
    let key = p.register("Items", items_descriptor()).unwrap();

    p.transact(None, |txn| {
        for id in ["a", "b", "c"].iter() {
            txn.persist_primary_entry(&key, b"v1", id.as_bytes(), id.as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    let ids = Mutex::new(vec![]);
    p.read(|txn| {
        txn.primary_index_scan(
            &key,
            ScanBound::Extent,
            ScanBound::Extent,
            ScanOrder::Descending,
            |item| {
                ids.lock().unwrap().push(item.identifier);
                Ok(true)
            },
        )
    })
    .unwrap();
    assert_eq!(
        *ids.lock().unwrap(),
        vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
    );

    cleanup(p);
}

#[test]
fn test_secondary_reference_scan_resolves_primary() {
    let p = Persistence::open(scratch_config("txn-refscan")).unwrap();
    let descriptor = {
        let mut d = Descriptor::new("v1", "Item", "String");
        d.add_secondary_index(IndexDescriptor::new("tag", "String", "v1"));
        d
    };
    let key = p.register("Items", descriptor).unwrap();

    p.transact(None, |txn| {
        txn.persist_primary_entry(&key, b"v1", b"1", b"body-one")?;
        txn.persist_secondary_entry(&key, "tag", b"red", b"1")?;
        txn.persist_secondary_entry(&key, "tag", b"blue", b"2") // dangling
    })
    .unwrap();

    let items = Mutex::new(vec![]);
    p.read(|txn| {
        txn.secondary_index_scan(
            &key,
            "tag",
            ScanBound::Extent,
            ScanBound::Extent,
            ScanOrder::Ascending,
            |item| {
                items.lock().unwrap().push(item);
                Ok(true)
            },
        )
    })
    .unwrap();

    let items = items.lock().unwrap();
    assert_eq!(items.len(), 2);
    // "blue" sorts before "red".
    assert_eq!(items[0].index_value.as_deref(), Some(b"blue".as_ref()));
    assert_eq!(items[0].content, None); // no primary record behind it
    assert_eq!(items[1].index_value.as_deref(), Some(b"red".as_ref()));
    assert_eq!(items[1].content, Some(b"body-one".to_vec()));

    cleanup(p);
}

#[test]
fn test_delete_whole_index() {
    let p = Persistence::open(scratch_config("txn-delindex")).unwrap();
    let key = p.register("Items", items_descriptor()).unwrap();

    p.transact(None, |txn| {
        txn.persist_primary_entry(&key, b"v1", b"1", b"x")?;
        txn.persist_direct_entry(&key, "title", b"v1", b"t", b"1", b"x")
    })
    .unwrap();

    p.transact(Some("drop title"), |txn| txn.delete_direct_index(&key, "title"))
        .unwrap();

    let res: Result<()> = p.read(|txn| {
        txn.direct_index_scan(
            &key,
            "title",
            ScanBound::Extent,
            ScanBound::Extent,
            ScanOrder::Ascending,
            |_| Ok(true),
        )
    });
    match res {
        Err(Error::IndexNotFound(_, _)) => (),
        other => panic!("{:?}", other),
    }

    cleanup(p);
}
