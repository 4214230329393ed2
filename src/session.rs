//! Session identifier manager.
//!
//! Owns the lifecycle of the identifier that correlates uploads and chat
//! turns with server-side state. One [`SessionManager`] corresponds to one
//! client context; several managers sharing storage tiers and a
//! [`SessionBus`] behave like several tabs of the same browser.
//!
//! Resolution order on [`SessionManager::get_or_create`]:
//!
//! 1. Apply pending bus updates and any newer record another process wrote
//!    to a shared tier, then return the cached value if any.
//! 2. Probe tiers in priority order (durable, session-scoped, memory) and
//!    read the record from the first one that answers.
//! 3. Discard it if it is missing, too short, a placeholder, or older than
//!    the retention window; try to recover a valid copy from the other tiers.
//! 4. Otherwise generate a new identifier, write it to the first writable
//!    tier, mirror a backup into the next one, and broadcast it.
//!
//! None of these steps can fail from the caller's point of view: storage
//! errors drop the tier, entropy errors drop to the next generator.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::{RngCore, TryRngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::StorageError;
use crate::model::{
    BusMessage, SESSION_RETENTION_MS, SessionRecord, is_usable_session_id, now_millis,
    parse_stored_timestamp,
};
use crate::storage::file::FileStore;
use crate::storage::memory::MemoryStore;
use crate::storage::{KeyValueStore, SESSION_BACKUP_KEY, SESSION_ID_KEY, SESSION_TIMESTAMP_KEY};
use crate::sync::{BusListener, SessionBus};

// ---------------------------------------------------------------------------
// Identifier generation
// ---------------------------------------------------------------------------

/// A source of random bytes that may be unavailable.
pub trait EntropySource: Send + Sync {
    fn name(&self) -> &str;

    fn fill(&self, buf: &mut [u8]) -> Result<(), String>;
}

/// Operating-system CSPRNG.
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn name(&self) -> &str {
        "os"
    }

    fn fill(&self, buf: &mut [u8]) -> Result<(), String> {
        rand::rngs::OsRng
            .try_fill_bytes(buf)
            .map_err(|e| e.to_string())
    }
}

/// Thread-local CSPRNG, reseeded from the OS periodically.
pub struct ThreadEntropy;

impl EntropySource for ThreadEntropy {
    fn name(&self) -> &str {
        "thread"
    }

    fn fill(&self, buf: &mut [u8]) -> Result<(), String> {
        rand::rng().fill_bytes(buf);
        Ok(())
    }
}

/// How an identifier was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdMethod {
    /// UUID v4 from the primary secure source.
    SecureUuid,
    /// Random bytes from the secondary source with version bits set by hand.
    ManualUuid,
    /// Timestamp, per-process randomness and environment, hashed.
    Fallback,
}

/// Produces session identifiers, degrading through three strategies.
pub struct IdGenerator {
    primary: Box<dyn EntropySource>,
    secondary: Box<dyn EntropySource>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(Box::new(OsEntropy), Box::new(ThreadEntropy))
    }
}

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

impl IdGenerator {
    pub fn new(primary: Box<dyn EntropySource>, secondary: Box<dyn EntropySource>) -> Self {
        Self { primary, secondary }
    }

    pub fn generate(&self) -> (String, IdMethod) {
        let mut bytes = [0u8; 16];

        match self.primary.fill(&mut bytes) {
            Ok(()) => {
                let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
                return (id.hyphenated().to_string(), IdMethod::SecureUuid);
            }
            Err(e) => warn!(source = self.primary.name(), error = %e, "primary entropy unavailable"),
        }

        match self.secondary.fill(&mut bytes) {
            Ok(()) => {
                // Version 4, RFC 4122 variant.
                bytes[6] = (bytes[6] & 0x0f) | 0x40;
                bytes[8] = (bytes[8] & 0x3f) | 0x80;
                let id = uuid::Uuid::from_bytes(bytes);
                return (id.hyphenated().to_string(), IdMethod::ManualUuid);
            }
            Err(e) => {
                warn!(source = self.secondary.name(), error = %e, "secondary entropy unavailable")
            }
        }

        (fallback_id(), IdMethod::Fallback)
    }
}

/// `fb-<millis hex>-<16 hex digest chars>` built without any entropy API.
fn fallback_id() -> String {
    let now = chrono::Utc::now();
    let mut hasher = Sha256::new();
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(
        FALLBACK_COUNTER
            .fetch_add(1, Ordering::Relaxed)
            .to_le_bytes(),
    );
    // Per-process random keys of the std hash map.
    hasher.update(RandomState::new().build_hasher().finish().to_le_bytes());
    for var in ["HOSTNAME", "COMPUTERNAME", "USER", "USERNAME"] {
        if let Ok(value) = std::env::var(var) {
            hasher.update(value.as_bytes());
        }
    }
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("fb-{:x}-{hex}", now.timestamp_millis())
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Snapshot of the current identifier for display.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    /// Tier holding the primary copy (`"memory"` when nothing else works).
    pub tier: String,
    pub created_at: i64,
    pub expires_at: i64,
}

const MEMORY_TIER: &str = "memory";

/// Attempts at producing an id different from the one being replaced.
const MAX_GENERATE_ATTEMPTS: usize = 3;

/// Explicit session-identifier object; construct once per client context.
pub struct SessionManager {
    /// Persistent tiers in priority order.
    tiers: Vec<Arc<dyn KeyValueStore>>,
    /// Last-resort tier private to this manager.
    memory: MemoryStore,
    generator: IdGenerator,
    bus: Option<(SessionBus, BusListener)>,
    cached: Option<SessionRecord>,
    active_tier: Option<String>,
}

impl SessionManager {
    /// Manager over `tiers` (highest priority first), with no bus.
    pub fn new(tiers: Vec<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            tiers,
            memory: MemoryStore::new(MEMORY_TIER),
            generator: IdGenerator::default(),
            bus: None,
            cached: None,
            active_tier: None,
        }
    }

    /// Durable and session-scoped file tiers plus the configured bus.
    pub fn from_config(config: &Config) -> Self {
        let durable: Arc<dyn KeyValueStore> =
            Arc::new(FileStore::new("durable", config.durable_store_path()));
        let scoped: Arc<dyn KeyValueStore> =
            Arc::new(FileStore::new("session", config.session_store_path()));
        Self::new(vec![durable, scoped]).with_bus(SessionBus::named(&config.channel))
    }

    /// Subscribe to `bus`. Only updates published afterwards are seen.
    pub fn with_bus(mut self, bus: SessionBus) -> Self {
        let listener = bus.subscribe();
        self.bus = Some((bus, listener));
        self
    }

    pub fn with_generator(mut self, generator: IdGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// Return the current identifier, creating one if needed. Never fails.
    pub fn get_or_create(&mut self) -> String {
        self.sync();
        if let Some(record) = &self.cached {
            return record.id.clone();
        }

        if let Some((record, tier)) = self.load() {
            debug!(tier = %tier, "using stored session id");
            self.active_tier = Some(tier);
            let id = record.id.clone();
            self.cached = Some(record);
            return id;
        }

        let record = self.create_record(None);
        record.id
    }

    /// Replace the identifier unconditionally and announce the new one.
    pub fn refresh(&mut self) -> String {
        self.sync();
        let previous = self
            .cached
            .clone()
            .or_else(|| self.load().map(|(r, _)| r));
        self.clear_storage();
        self.cached = None;
        let record = self.create_record(previous.as_ref());
        info!("session id refreshed");
        record.id
    }

    /// Forget the identifier everywhere. The next access generates a new one.
    pub fn clear(&mut self) {
        self.clear_storage();
        self.cached = None;
        self.active_tier = None;
        info!("session id cleared");
    }

    /// Whether a usable identifier is obtainable.
    pub fn validate(&mut self) -> bool {
        let id = self.get_or_create();
        is_usable_session_id(&id)
    }

    /// Current identifier with its location and age.
    pub fn info(&mut self) -> SessionInfo {
        let session_id = self.get_or_create();
        let created_at = self
            .cached
            .as_ref()
            .map(|r| r.created_at)
            .unwrap_or_else(now_millis);
        SessionInfo {
            session_id,
            tier: self
                .active_tier
                .clone()
                .unwrap_or_else(|| MEMORY_TIER.to_string()),
            created_at,
            expires_at: created_at.saturating_add(SESSION_RETENTION_MS),
        }
    }

    /// Apply updates other contexts published, either on the bus or by
    /// writing a newer record to a shared tier (other processes). Returns
    /// whether the identifier changed.
    pub fn sync(&mut self) -> bool {
        let messages = match self.bus.as_mut() {
            Some((_, listener)) => listener.drain(),
            None => Vec::new(),
        };
        let mut changed = false;
        for message in messages {
            changed |= self.apply_update(&message);
        }
        changed | self.sync_from_storage()
    }

    /// Adopt an update if it is newer than what this context holds.
    ///
    /// Ordering is by `(timestamp, id)`, so every context converges on the
    /// same identifier no matter the delivery order.
    pub fn apply_update(&mut self, message: &BusMessage) -> bool {
        let BusMessage::SessionUpdate {
            session_id,
            timestamp,
        } = message;
        let incoming = SessionRecord::new(session_id.clone(), *timestamp);
        if !incoming.is_valid_at(now_millis()) {
            debug!("ignoring invalid session update");
            return false;
        }
        if let Some(current) = &self.cached {
            if !supersedes(&incoming, current) {
                debug!("ignoring stale session update");
                return false;
            }
        }
        self.persist(&incoming);
        info!(tier = ?self.active_tier, "adopted session id from another context");
        self.cached = Some(incoming);
        true
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Adopt a newer valid record found in a shared tier. A record removed
    /// by another context is not treated as an update.
    fn sync_from_storage(&mut self) -> bool {
        let Some(current) = &self.cached else {
            return false;
        };
        let now = now_millis();
        let stored = self.tiers.iter().find_map(|tier| {
            match read_record(tier.as_ref()) {
                Ok(Some(record)) if record.is_valid_at(now) => {
                    Some((record, tier.name().to_string()))
                }
                _ => None,
            }
        });
        let Some((record, tier)) = stored else {
            return false;
        };
        if !supersedes(&record, current) {
            return false;
        }
        info!(tier = %tier, "adopted session id stored by another context");
        self.active_tier = Some(tier);
        self.cached = Some(record);
        true
    }

    fn all_tiers(&self) -> impl Iterator<Item = &dyn KeyValueStore> {
        self.tiers
            .iter()
            .map(|t| t.as_ref())
            .chain(std::iter::once(&self.memory as &dyn KeyValueStore))
    }

    /// Generate, persist, broadcast and cache a record that replaces
    /// `previous` (different id, later timestamp).
    fn create_record(&mut self, previous: Option<&SessionRecord>) -> SessionRecord {
        let avoid = previous.map(|r| r.id.as_str());
        let (id, method) = (0..MAX_GENERATE_ATTEMPTS)
            .map(|_| self.generator.generate())
            .find(|(id, _)| Some(id.as_str()) != avoid)
            .unwrap_or_else(|| {
                warn!("entropy source keeps repeating; using fallback id");
                (fallback_id(), IdMethod::Fallback)
            });
        let created_at = match previous {
            Some(r) => now_millis().max(r.created_at + 1),
            None => now_millis(),
        };
        let record = SessionRecord::new(id, created_at);
        self.persist(&record);
        info!(method = ?method, tier = ?self.active_tier, "created session id");
        self.broadcast(&record);
        self.cached = Some(record.clone());
        record
    }

    fn broadcast(&self, record: &SessionRecord) {
        if let Some((bus, listener)) = &self.bus {
            bus.publish(
                listener,
                BusMessage::SessionUpdate {
                    session_id: record.id.clone(),
                    timestamp: record.created_at,
                },
            );
        }
    }

    /// Read from the first usable tier; recover from other tiers if its
    /// record is missing or invalid.
    fn load(&self) -> Option<(SessionRecord, String)> {
        let now = now_millis();
        let mut selected: Option<usize> = None;

        for (idx, tier) in self.all_tiers().enumerate() {
            if let Err(e) = tier.probe() {
                debug!(tier = tier.name(), error = %e, "storage tier unavailable");
                continue;
            }
            match read_record(tier) {
                Ok(Some(record)) if record.is_valid_at(now) => {
                    return Some((record, tier.name().to_string()));
                }
                Ok(Some(_)) => {
                    info!(tier = tier.name(), "discarding expired or malformed session id");
                    clear_primary(tier);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(tier = tier.name(), error = %e, "storage tier unreadable");
                    continue;
                }
            }
            selected = Some(idx);
            break;
        }

        let selected = selected?;
        let recovered = self
            .all_tiers()
            .enumerate()
            .filter(|(idx, _)| *idx != selected)
            .find_map(|(_, tier)| recover_from(tier, now))?;

        let tier = self.all_tiers().nth(selected)?;
        match write_record(tier, &recovered) {
            Ok(()) => {
                info!(tier = tier.name(), "restored session id from backup");
                Some((recovered, tier.name().to_string()))
            }
            Err(e) => {
                warn!(tier = tier.name(), error = %e, "could not restore session id backup");
                Some((recovered, MEMORY_TIER.to_string()))
            }
        }
    }

    /// Write to the first writable tier and mirror a backup into the next
    /// writable persistent tier.
    fn persist(&mut self, record: &SessionRecord) {
        let mut primary: Option<(usize, String)> = None;
        for (idx, tier) in self.all_tiers().enumerate() {
            if let Err(e) = tier.probe() {
                debug!(tier = tier.name(), error = %e, "storage tier unavailable");
                continue;
            }
            match write_record(tier, record) {
                Ok(()) => {
                    primary = Some((idx, tier.name().to_string()));
                    break;
                }
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "failed to store session id");
                    clear_primary(tier);
                }
            }
        }

        let Some((primary_idx, name)) = primary else {
            warn!("no storage tier writable; session id kept in memory only");
            self.active_tier = None;
            return;
        };

        if let Ok(backup) = serde_json::to_string(record) {
            for tier in self.tiers.iter().skip(primary_idx + 1) {
                if tier.probe().is_err() {
                    continue;
                }
                match tier.set(SESSION_BACKUP_KEY, &backup) {
                    Ok(()) => {
                        trace!(tier = tier.name(), "mirrored session id backup");
                        break;
                    }
                    Err(e) => debug!(tier = tier.name(), error = %e, "backup write failed"),
                }
            }
        }

        self.active_tier = Some(name);
    }

    fn clear_storage(&self) {
        for tier in self.all_tiers() {
            clear_primary(tier);
            if let Err(e) = tier.remove(SESSION_BACKUP_KEY) {
                debug!(tier = tier.name(), error = %e, "could not remove session backup");
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field(
                "tiers",
                &self.tiers.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("bus", &self.bus.as_ref().map(|(b, _)| b.name()))
            .field("cached", &self.cached)
            .field("active_tier", &self.active_tier)
            .finish()
    }
}

/// Primary record of a tier. A missing or unparseable timestamp yields a
/// record stamped at the epoch, which then fails the age check.
/// Last-writer-wins order on `(created_at, id)`.
fn supersedes(incoming: &SessionRecord, current: &SessionRecord) -> bool {
    incoming.id != current.id
        && (incoming.created_at, incoming.id.as_str()) > (current.created_at, current.id.as_str())
}

fn read_record(tier: &dyn KeyValueStore) -> Result<Option<SessionRecord>, StorageError> {
    let id = tier.get(SESSION_ID_KEY)?;
    let timestamp = tier.get(SESSION_TIMESTAMP_KEY)?;
    match id {
        Some(id) => {
            let created_at = timestamp
                .as_deref()
                .and_then(parse_stored_timestamp)
                .unwrap_or(0);
            Ok(Some(SessionRecord::new(id, created_at)))
        }
        None => {
            if timestamp.is_some() {
                let _ = tier.remove(SESSION_TIMESTAMP_KEY);
            }
            Ok(None)
        }
    }
}

fn write_record(tier: &dyn KeyValueStore, record: &SessionRecord) -> Result<(), StorageError> {
    tier.set(SESSION_ID_KEY, &record.id)?;
    if let Err(e) = tier.set(SESSION_TIMESTAMP_KEY, &record.created_at.to_string()) {
        let _ = tier.remove(SESSION_ID_KEY);
        return Err(e);
    }
    Ok(())
}

fn clear_primary(tier: &dyn KeyValueStore) {
    for key in [SESSION_ID_KEY, SESSION_TIMESTAMP_KEY] {
        if let Err(e) = tier.remove(key) {
            debug!(tier = tier.name(), key, error = %e, "could not remove session key");
        }
    }
}

/// A valid record from this tier's backup key or primary keys.
fn recover_from(tier: &dyn KeyValueStore, now: i64) -> Option<SessionRecord> {
    if let Ok(Some(raw)) = tier.get(SESSION_BACKUP_KEY) {
        match serde_json::from_str::<SessionRecord>(&raw) {
            Ok(record) if record.is_valid_at(now) => return Some(record),
            _ => {
                let _ = tier.remove(SESSION_BACKUP_KEY);
            }
        }
    }
    match read_record(tier) {
        Ok(Some(record)) if record.is_valid_at(now) => Some(record),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl EntropySource for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn fill(&self, _buf: &mut [u8]) -> Result<(), String> {
            Err("no entropy".to_string())
        }
    }

    struct Fixed(u8);

    impl EntropySource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn fill(&self, buf: &mut [u8]) -> Result<(), String> {
            buf.fill(self.0);
            Ok(())
        }
    }

    #[test]
    fn secure_source_yields_v4_uuid() {
        let (id, method) = IdGenerator::default().generate();
        assert_eq!(method, IdMethod::SecureUuid);
        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert!(is_usable_session_id(&id));
    }

    #[test]
    fn secondary_source_is_shaped_into_uuid_form() {
        let generator = IdGenerator::new(Box::new(Broken), Box::new(Fixed(0xff)));
        let (id, method) = generator.generate();
        assert_eq!(method, IdMethod::ManualUuid);
        assert_eq!(id, "ffffffff-ffff-4fff-bfff-ffffffffffff");
        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(parsed.get_variant(), uuid::Variant::RFC4122);
    }

    #[test]
    fn fallback_ids_are_usable_and_distinct() {
        let generator = IdGenerator::new(Box::new(Broken), Box::new(Broken));
        let (a, method) = generator.generate();
        let (b, _) = generator.generate();
        assert_eq!(method, IdMethod::Fallback);
        assert!(a.starts_with("fb-"));
        assert!(is_usable_session_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn refresh_with_stuck_source_falls_back_to_new_id() {
        let generator = IdGenerator::new(Box::new(Fixed(0x11)), Box::new(Fixed(0x22)));
        let mut manager = SessionManager::new(Vec::new()).with_generator(generator);
        let first = manager.get_or_create();
        assert_eq!(first, "11111111-1111-4111-9111-111111111111");

        let second = manager.refresh();
        assert_ne!(first, second);
        assert!(second.starts_with("fb-"));
        assert_eq!(manager.get_or_create(), second);
    }

    #[test]
    fn memory_only_manager_reports_memory_tier() {
        let mut manager = SessionManager::new(Vec::new());
        let info = manager.info();
        assert_eq!(info.tier, "memory");
        assert_eq!(info.expires_at - info.created_at, SESSION_RETENTION_MS);
    }

    #[test]
    fn stray_timestamp_without_id_is_removed() {
        let store = MemoryStore::new("t");
        store.set(SESSION_TIMESTAMP_KEY, "1700000000000").unwrap();
        assert_eq!(read_record(&store).unwrap(), None);
        assert_eq!(store.get(SESSION_TIMESTAMP_KEY).unwrap(), None);
    }

    #[test]
    fn id_without_timestamp_reads_as_expired() {
        let store = MemoryStore::new("t");
        store
            .set(SESSION_ID_KEY, "6f1c2a8e-5b7d-4c3e-9a10-2b4d6e8f0a1c")
            .unwrap();
        let record = read_record(&store).unwrap().unwrap();
        assert!(!record.is_valid_at(now_millis()));
    }
}
