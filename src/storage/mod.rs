//! Storage tier trait and concrete key-value backends.
//!
//! The session manager holds an ordered list of tiers (durable, then
//! session-scoped, then in-memory) and tries them in sequence. Every
//! operation returns a [`StorageError`] instead of panicking, so a broken
//! tier simply drops out of the rotation.

pub mod file;
pub mod memory;

use crate::error::StorageError;

/// Key holding the primary session identifier.
pub const SESSION_ID_KEY: &str = "docchat.session.id";
/// Key holding the identifier's write time (decimal epoch milliseconds).
pub const SESSION_TIMESTAMP_KEY: &str = "docchat.session.timestamp";
/// Key holding a JSON [`SessionRecord`](crate::model::SessionRecord) mirror.
pub const SESSION_BACKUP_KEY: &str = "docchat.session.backup";

const PROBE_KEY: &str = "docchat.__probe__";

/// A string key-value backend.
///
/// Object-safe so tiers can be stored as `Arc<dyn KeyValueStore>` and shared
/// between several session managers.
pub trait KeyValueStore: Send + Sync {
    /// Short name used in logs and `session show` (e.g. `"durable"`).
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Check the tier with a write-read-delete round trip.
    ///
    /// A tier that accepts the write but returns something else on read
    /// (or nothing) is reported as unavailable.
    fn probe(&self) -> Result<(), StorageError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.set(PROBE_KEY, &token)?;
        let read_back = self.get(PROBE_KEY)?;
        self.remove(PROBE_KEY)?;
        if read_back.as_deref() == Some(token.as_str()) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                tier: self.name().to_string(),
                reason: "probe value did not read back".to_string(),
            })
        }
    }
}
