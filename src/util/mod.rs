//! Module implement common utility functions and types.

use serde::{de::DeserializeOwned, Serialize};

use std::{ffi, fs, io::Write, path};

use crate::{Error, Result};

/// Write `data` into `file` and flush it to disk. Any existing file is
/// replaced in a single step: data lands in a sibling temporary file
/// which is then renamed over the target.
pub fn atomic_write(file: &ffi::OsStr, data: &[u8]) -> Result<()> {
    let os_file = path::Path::new(file);

    let parent = match os_file.parent() {
        Some(parent) => Ok(parent),
        None => err_at!(InvalidFile, msg: "{:?}", file),
    }?;
    err_at!(IOError, fs::create_dir_all(parent))?;

    let tmp_file = {
        let mut name = os_file
            .file_name()
            .map(|s| s.to_os_string())
            .unwrap_or_else(ffi::OsString::new);
        name.push(".tmp");
        parent.join(name)
    };

    {
        let mut fd = err_at!(
            IOError,
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_file)
        )?;
        let n = err_at!(IOError, fd.write(data))?;
        if n != data.len() {
            err_at!(IOError, msg: "partial write {:?} {}/{}", tmp_file, n, data.len())?
        }
        err_at!(IOError, fd.sync_all())?;
    }

    err_at!(IOError, fs::rename(&tmp_file, os_file))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and atomically write it into `file`.
pub fn save_json<T>(file: &ffi::OsStr, value: &T) -> Result<()>
where
    T: Serialize,
{
    let data = err_at!(FailJson, serde_json::to_vec_pretty(value))?;
    atomic_write(file, &data)
}

/// Load JSON file and parse it into type `T`.
pub fn load_json<T>(file: &ffi::OsStr) -> Result<T>
where
    T: DeserializeOwned,
{
    let data = err_at!(IOError, fs::read(path::Path::new(file)))?;
    err_at!(FailJson, serde_json::from_slice(&data), "file:{:?}", file)
}

/// Recursively visit everything below `dir`, a directory before its
/// contents. The callback gets each entry's path and whether that entry
/// is itself a directory. Used to stream-copy snapshot trees and to
/// sweep datastore trees for prunable files.
pub fn walk<F>(dir: &path::Path, visit: &mut F) -> Result<()>
where
    F: FnMut(&path::Path, bool) -> Result<()>,
{
    for entry in err_at!(IOError, fs::read_dir(dir), "read_dir({:?})", dir)? {
        let entry = err_at!(IOError, entry)?;
        let loc = entry.path();
        let is_dir = err_at!(IOError, entry.file_type())?.is_dir();
        visit(&loc, is_dir)?;
        if is_dir {
            walk(&loc, visit)?;
        }
    }
    Ok(())
}

/// Remove dated sub-directories that became empty after a prune sweep.
/// Leaves `dir` itself in place.
pub fn remove_empty_dirs(dir: &path::Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in err_at!(IOError, fs::read_dir(dir))? {
        let entry = err_at!(IOError, entry)?;
        if err_at!(IOError, entry.file_type())?.is_dir() {
            remove_empty_dirs(&entry.path())?;
            fs::remove_dir(entry.path()).ok(); // fails on non-empty, which is fine
        }
    }
    Ok(())
}

/// Serde adaptor for ISO-8601 dates with millisecond precision, GMT.
pub mod iso8601 {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}", date.format(FORMAT)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let naive = NaiveDateTime::parse_from_str(&s, FORMAT)
            .map_err(serde::de::Error::custom)?;
        Ok(DateTime::from_utc(naive, Utc))
    }
}
