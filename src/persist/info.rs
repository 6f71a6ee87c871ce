//! Store info, the tiny top level record of one persistence directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dated::DatedId;

/// On-disk format version. The only version that exists.
pub const FORMAT_VERSION: &str = "alpha";

/// Contents of `Info.json`. Created on first write, rewritten atomically
/// on every commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_snapshot: Option<DatedId>,
    #[serde(with = "crate::util::iso8601")]
    pub modification_date: DateTime<Utc>,
}

impl Default for StoreInfo {
    fn default() -> StoreInfo {
        StoreInfo {
            version: FORMAT_VERSION.to_string(),
            current_snapshot: None,
            modification_date: Utc::now(),
        }
    }
}

#[cfg(test)]
#[path = "info_test.rs"]
mod info_test;
