//! Cowdb is an embedded, single-writer/multi-reader, persistent store
//! for indexed records. Every committed transaction produces an immutable
//! _iteration_, a copy-on-write snapshot of the full store reachable via
//! a chain of preceding/successive pointers. Old iterations remain valid
//! for concurrent readers until a retention policy prunes them.
//!
//! The store is layered as a hierarchy of persistent objects,
//!
//! ```text
//! Persistence -> Snapshot -> SnapshotIteration -> DatastoreRoot
//!             -> IndexManifest -> Page -> Block -> Entry
//! ```
//!
//! Writes never mutate a persisted file. A transaction builds new pages,
//! new manifests, new roots and a new iteration in memory and commits
//! them with a sequence of atomic file replacements, the last of which
//! (the snapshot manifest) is the single commit point. A crash at any
//! point leaves the store at the previously committed iteration, with
//! unreachable files collected by the pruner on a later run.
//!
//! Refer to [Persistence] type to get started.

use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Macro expanded to,
///
/// ```ignore
/// Error::<variant>(String::default(), format!(msg))
/// ```
///
/// where `msg` is the legible string capturing the error context,
/// and first parameter prefixed with `file!()` and `line!()`.
#[macro_export]
macro_rules! err_at {
    ($variant:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$variant(prefix, format!($($arg),+)))
    }};
    ($variant:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$variant(prefix, format!("{}", err)))
            }
        }
    }};
    ($variant:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$variant(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

pub mod dated;
pub mod index;
pub mod page;
pub mod persist;
pub mod snap;
pub mod store;
pub mod txn;
pub mod util;

pub use crate::dated::DatedId;
pub use crate::index::{IndexKind, InsertionCursor, InstanceCursor, KeyOrder};
pub use crate::persist::{Config, Persistence, RetentionPolicy};
pub use crate::store::{
    BufferingPolicy, DatastoreKey, Descriptor, Event, IndexDescriptor, Observer,
};
pub use crate::txn::{Mode, ScanBound, ScanItem, ScanOrder, Transaction};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically the file and line where the
/// error was composed, and a legible message.
pub enum Error {
    Fatal(String, String),
    IOError(String, String),
    FailConvert(String, String),
    FailJson(String, String),
    ThreadFail(String, String),
    InvalidFile(String, String),
    InvalidInput(String, String),
    NotFileUrl(String, String),
    MissingAppSupportDir(String, String),
    CannotWrite(String, String),
    WrongPersistence(String, String),
    DatastoreNotFound(String, String),
    DatastoreKeyNotFound(String, String),
    IndexNotFound(String, String),
    MultipleRegistrations(String, String),
    AlreadyRegistered(String, String),
    DuplicateWriters(String, String),
    InstanceNotFound(String, String),
    InstanceAlreadyExists(String, String),
    UnknownCursor(String, String),
    StaleCursor(String, String),
    TransactionInactive(String, String),
    TransactingWithinExternalPersistence(String, String),
    InvalidIndexManifestFormat(String, String),
    InvalidPageFormat(String, String),
    InvalidEntryFormat(String, String),
    NestedStoreWrite(String, String),
    NestedSnapshotWrite(String, String),
}

impl Error {
    fn pretty(&self) -> (&'static str, &str, &str) {
        use Error::*;

        match self {
            Fatal(p, m) => ("Fatal", p, m),
            IOError(p, m) => ("IOError", p, m),
            FailConvert(p, m) => ("FailConvert", p, m),
            FailJson(p, m) => ("FailJson", p, m),
            ThreadFail(p, m) => ("ThreadFail", p, m),
            InvalidFile(p, m) => ("InvalidFile", p, m),
            InvalidInput(p, m) => ("InvalidInput", p, m),
            NotFileUrl(p, m) => ("NotFileUrl", p, m),
            MissingAppSupportDir(p, m) => ("MissingAppSupportDir", p, m),
            CannotWrite(p, m) => ("CannotWrite", p, m),
            WrongPersistence(p, m) => ("WrongPersistence", p, m),
            DatastoreNotFound(p, m) => ("DatastoreNotFound", p, m),
            DatastoreKeyNotFound(p, m) => ("DatastoreKeyNotFound", p, m),
            IndexNotFound(p, m) => ("IndexNotFound", p, m),
            MultipleRegistrations(p, m) => ("MultipleRegistrations", p, m),
            AlreadyRegistered(p, m) => ("AlreadyRegistered", p, m),
            DuplicateWriters(p, m) => ("DuplicateWriters", p, m),
            InstanceNotFound(p, m) => ("InstanceNotFound", p, m),
            InstanceAlreadyExists(p, m) => ("InstanceAlreadyExists", p, m),
            UnknownCursor(p, m) => ("UnknownCursor", p, m),
            StaleCursor(p, m) => ("StaleCursor", p, m),
            TransactionInactive(p, m) => ("TransactionInactive", p, m),
            TransactingWithinExternalPersistence(p, m) => {
                ("TransactingWithinExternalPersistence", p, m)
            }
            InvalidIndexManifestFormat(p, m) => ("InvalidIndexManifestFormat", p, m),
            InvalidPageFormat(p, m) => ("InvalidPageFormat", p, m),
            InvalidEntryFormat(p, m) => ("InvalidEntryFormat", p, m),
            NestedStoreWrite(p, m) => ("NestedStoreWrite", p, m),
            NestedSnapshotWrite(p, m) => ("NestedSnapshotWrite", p, m),
        }
    }

    /// Return the variant name, handy while asserting error kinds in tests.
    pub fn to_kind(&self) -> &'static str {
        self.pretty().0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let (name, prefix, msg) = self.pretty();
        write!(f, "{}, at:{} {}", name, prefix, msg)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
