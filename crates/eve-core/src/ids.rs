//! Surrogate id generation. Warehouse rows use SQLite `INTEGER PRIMARY KEY`
//! autoincrement ids; queue jobs and runs use opaque UUID strings since they
//! are handed out to callers before any row exists.

use uuid::Uuid;

/// A fresh opaque identifier for a queue job, run, or lease owner tag.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
