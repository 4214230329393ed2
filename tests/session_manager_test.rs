//! Session identifier lifecycle tests.
//!
//! Covers idempotence, expiry, malformed values, tier fallback (including
//! every tier being unavailable), refresh/clear, backup recovery, and
//! convergence of several managers over a shared bus.

use std::sync::Arc;

use docchat::error::StorageError;
use docchat::model::{BusMessage, SESSION_RETENTION_MS, is_usable_session_id, now_millis};
use docchat::session::{EntropySource, IdGenerator, SessionManager};
use docchat::storage::file::FileStore;
use docchat::storage::memory::MemoryStore;
use docchat::storage::{KeyValueStore, SESSION_BACKUP_KEY, SESSION_ID_KEY, SESSION_TIMESTAMP_KEY};
use docchat::sync::SessionBus;

/// A tier that refuses every operation, like storage in private mode.
struct Unavailable(&'static str);

impl KeyValueStore for Unavailable {
    fn name(&self) -> &str {
        self.0
    }
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(self.err())
    }
    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(self.err())
    }
    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(self.err())
    }
}

impl Unavailable {
    fn err(&self) -> StorageError {
        StorageError::Unavailable {
            tier: self.0.to_string(),
            reason: "access denied".to_string(),
        }
    }
}

struct NoEntropy;

impl EntropySource for NoEntropy {
    fn name(&self) -> &str {
        "none"
    }
    fn fill(&self, _buf: &mut [u8]) -> Result<(), String> {
        Err("no randomness available".to_string())
    }
}

fn memory_tier(name: &str) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(name))
}

fn tiers(stores: &[&Arc<MemoryStore>]) -> Vec<Arc<dyn KeyValueStore>> {
    stores
        .iter()
        .map(|s| Arc::clone(*s) as Arc<dyn KeyValueStore>)
        .collect()
}

fn seed(store: &MemoryStore, id: &str, created_at: i64) {
    store.set(SESSION_ID_KEY, id).unwrap();
    store
        .set(SESSION_TIMESTAMP_KEY, &created_at.to_string())
        .unwrap();
}

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const OLD_ID: &str = "0b9e1c52-4f0e-4a7c-8d61-3f7c2a9e5b10";

// =====================================================================
// get-or-create
// =====================================================================

#[test]
fn get_or_create_is_idempotent_within_a_manager() {
    let durable = memory_tier("durable");
    let mut manager = SessionManager::new(tiers(&[&durable]));

    let first = manager.get_or_create();
    let second = manager.get_or_create();

    assert_eq!(first, second);
    assert!(is_usable_session_id(&first));
    assert_eq!(durable.get(SESSION_ID_KEY).unwrap(), Some(first));
}

#[test]
fn generated_id_is_a_v4_uuid() {
    let mut manager = SessionManager::new(Vec::new());
    let id = manager.get_or_create();
    let parsed = uuid::Uuid::parse_str(&id).expect("generated id should be a UUID");
    assert_eq!(parsed.get_version_num(), 4);
}

#[test]
fn id_survives_a_reload_through_the_durable_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("session.json");

    let first = {
        let durable: Arc<dyn KeyValueStore> = Arc::new(FileStore::new("durable", &path));
        SessionManager::new(vec![durable]).get_or_create()
    };
    let durable: Arc<dyn KeyValueStore> = Arc::new(FileStore::new("durable", &path));
    let mut reloaded = SessionManager::new(vec![durable]);

    assert_eq!(reloaded.get_or_create(), first);
    assert_eq!(reloaded.info().tier, "durable");
}

#[test]
fn stored_valid_id_is_reused() {
    let durable = memory_tier("durable");
    seed(&durable, OLD_ID, now_millis() - 29 * DAY_MS);

    let mut manager = SessionManager::new(tiers(&[&durable]));
    assert_eq!(manager.get_or_create(), OLD_ID);
}

#[test]
fn id_older_than_thirty_days_is_replaced() {
    let durable = memory_tier("durable");
    seed(&durable, OLD_ID, now_millis() - 31 * DAY_MS);

    let mut manager = SessionManager::new(tiers(&[&durable]));
    let id = manager.get_or_create();

    assert_ne!(id, OLD_ID);
    assert_eq!(durable.get(SESSION_ID_KEY).unwrap().as_deref(), Some(id.as_str()));
    let stamp: i64 = durable
        .get(SESSION_TIMESTAMP_KEY)
        .unwrap()
        .unwrap()
        .parse()
        .unwrap();
    assert!(now_millis() - stamp < DAY_MS);
}

#[test]
fn short_id_is_replaced() {
    let durable = memory_tier("durable");
    seed(&durable, "abc123", now_millis());

    let mut manager = SessionManager::new(tiers(&[&durable]));
    let id = manager.get_or_create();

    assert_ne!(id, "abc123");
    assert!(is_usable_session_id(&id));
}

#[test]
fn placeholder_id_is_replaced() {
    let durable = memory_tier("durable");
    seed(&durable, "undefined", now_millis());

    let mut manager = SessionManager::new(tiers(&[&durable]));
    assert_ne!(manager.get_or_create(), "undefined");
}

#[test]
fn id_with_out_of_range_timestamp_is_replaced() {
    let durable = memory_tier("durable");
    durable.set(SESSION_ID_KEY, OLD_ID).unwrap();
    durable
        .set(SESSION_TIMESTAMP_KEY, "-9000000000000000000")
        .unwrap();

    let mut manager = SessionManager::new(tiers(&[&durable]));
    let id = manager.get_or_create();

    assert_ne!(id, OLD_ID);
    assert!(is_usable_session_id(&id));
    assert_eq!(durable.get(SESSION_ID_KEY).unwrap(), Some(id));
}

#[test]
fn id_without_timestamp_is_replaced() {
    let durable = memory_tier("durable");
    durable.set(SESSION_ID_KEY, OLD_ID).unwrap();

    let mut manager = SessionManager::new(tiers(&[&durable]));
    assert_ne!(manager.get_or_create(), OLD_ID);
}

// =====================================================================
// Tier fallback
// =====================================================================

#[test]
fn all_tiers_unavailable_still_yields_stable_id() {
    let mut manager = SessionManager::new(vec![
        Arc::new(Unavailable("durable")),
        Arc::new(Unavailable("session")),
    ]);

    let first = manager.get_or_create();
    assert!(is_usable_session_id(&first));
    assert_eq!(manager.get_or_create(), first);
    assert_eq!(manager.info().tier, "memory");
    assert!(manager.validate());
}

#[test]
fn all_tiers_and_entropy_unavailable_still_yields_id() {
    let generator = IdGenerator::new(Box::new(NoEntropy), Box::new(NoEntropy));
    let mut manager =
        SessionManager::new(vec![Arc::new(Unavailable("durable"))]).with_generator(generator);

    let id = manager.get_or_create();
    assert!(id.starts_with("fb-"));
    assert!(is_usable_session_id(&id));
    assert_eq!(manager.get_or_create(), id);
}

#[test]
fn unavailable_durable_tier_falls_through_to_session_tier() {
    let session = memory_tier("session");
    let durable: Arc<dyn KeyValueStore> = Arc::new(Unavailable("durable"));
    let mut manager = SessionManager::new(vec![durable, session.clone()]);

    let id = manager.get_or_create();
    assert_eq!(session.get(SESSION_ID_KEY).unwrap(), Some(id));
    assert_eq!(manager.info().tier, "session");
}

#[test]
fn quota_exceeded_on_write_falls_through_to_next_tier() {
    // Room for the probe key but not for id plus timestamp.
    let durable = Arc::new(MemoryStore::with_capacity_limit("durable", 1));
    let session = memory_tier("session");
    let mut manager = SessionManager::new(vec![
        durable.clone() as Arc<dyn KeyValueStore>,
        session.clone() as Arc<dyn KeyValueStore>,
    ]);

    let id = manager.get_or_create();
    assert!(durable.is_empty(), "partial write should be rolled back");
    assert_eq!(session.get(SESSION_ID_KEY).unwrap(), Some(id));
}

#[test]
fn backup_is_mirrored_into_next_tier() {
    let durable = memory_tier("durable");
    let session = memory_tier("session");
    let mut manager = SessionManager::new(tiers(&[&durable, &session]));

    let id = manager.get_or_create();
    let backup = session.get(SESSION_BACKUP_KEY).unwrap().expect("backup written");
    let value: serde_json::Value = serde_json::from_str(&backup).unwrap();
    assert_eq!(value["id"], id.as_str());
    assert!(value["createdAt"].as_i64().is_some());
    // Backup only, primary keys stay in the durable tier.
    assert_eq!(session.get(SESSION_ID_KEY).unwrap(), None);
}

#[test]
fn lost_primary_is_restored_from_backup() {
    let durable = memory_tier("durable");
    let session = memory_tier("session");
    let original = SessionManager::new(tiers(&[&durable, &session])).get_or_create();

    durable.remove(SESSION_ID_KEY).unwrap();
    durable.remove(SESSION_TIMESTAMP_KEY).unwrap();

    let mut reloaded = SessionManager::new(tiers(&[&durable, &session]));
    assert_eq!(reloaded.get_or_create(), original);
    assert_eq!(durable.get(SESSION_ID_KEY).unwrap(), Some(original));
}

#[test]
fn expired_backup_is_not_restored() {
    let durable = memory_tier("durable");
    let session = memory_tier("session");
    let stale = serde_json::json!({"id": OLD_ID, "createdAt": now_millis() - 40 * DAY_MS});
    session
        .set(SESSION_BACKUP_KEY, &stale.to_string())
        .unwrap();

    let mut manager = SessionManager::new(tiers(&[&durable, &session]));
    assert_ne!(manager.get_or_create(), OLD_ID);
}

// =====================================================================
// refresh / clear / validate
// =====================================================================

#[test]
fn refresh_yields_different_id_and_persists_it() {
    let durable = memory_tier("durable");
    let mut manager = SessionManager::new(tiers(&[&durable]));

    let before = manager.get_or_create();
    let after = manager.refresh();

    assert_ne!(before, after);
    assert_eq!(manager.get_or_create(), after);
    assert_eq!(durable.get(SESSION_ID_KEY).unwrap(), Some(after.clone()));

    let mut reloaded = SessionManager::new(tiers(&[&durable]));
    assert_eq!(reloaded.get_or_create(), after);
}

#[test]
fn refresh_without_prior_access_replaces_stored_id() {
    let durable = memory_tier("durable");
    seed(&durable, OLD_ID, now_millis() - DAY_MS);

    let mut manager = SessionManager::new(tiers(&[&durable]));
    assert_ne!(manager.refresh(), OLD_ID);
}

#[test]
fn clear_then_get_generates_new_id() {
    let durable = memory_tier("durable");
    let session = memory_tier("session");
    let mut manager = SessionManager::new(tiers(&[&durable, &session]));

    let before = manager.get_or_create();
    manager.clear();

    assert_eq!(durable.get(SESSION_ID_KEY).unwrap(), None);
    assert_eq!(durable.get(SESSION_TIMESTAMP_KEY).unwrap(), None);
    assert_eq!(session.get(SESSION_BACKUP_KEY).unwrap(), None);

    let after = manager.get_or_create();
    assert_ne!(before, after);
}

#[test]
fn clear_tolerates_unavailable_tiers() {
    let mut manager = SessionManager::new(vec![Arc::new(Unavailable("durable"))]);
    let before = manager.get_or_create();
    manager.clear();
    assert_ne!(manager.get_or_create(), before);
}

#[test]
fn info_reports_expiry_thirty_days_out() {
    let durable = memory_tier("durable");
    let mut manager = SessionManager::new(tiers(&[&durable]));
    let info = manager.info();
    assert_eq!(info.tier, "durable");
    assert_eq!(info.expires_at - info.created_at, SESSION_RETENTION_MS);
}

// =====================================================================
// Cross-context sync
// =====================================================================

#[test]
fn broadcast_update_is_adopted_by_listener() {
    let bus = SessionBus::detached("session-test-adopt");
    let store = memory_tier("durable");
    let mut listener = SessionManager::new(tiers(&[&store])).with_bus(bus.clone());
    let own = listener.get_or_create();

    let announcer = bus.subscribe();
    let incoming = "5d7c4e1a-9b2f-4c80-a3d6-1e8f0b7a6c24".to_string();
    bus.publish(
        &announcer,
        BusMessage::SessionUpdate {
            session_id: incoming.clone(),
            timestamp: now_millis() + 1_000,
        },
    );

    assert_ne!(own, incoming);
    assert_eq!(listener.get_or_create(), incoming);
    assert_eq!(store.get(SESSION_ID_KEY).unwrap(), Some(incoming));
}

#[test]
fn stale_broadcast_is_ignored() {
    let bus = SessionBus::detached("session-test-stale");
    let mut listener = SessionManager::new(Vec::new()).with_bus(bus.clone());
    let own = listener.get_or_create();

    let announcer = bus.subscribe();
    bus.publish(
        &announcer,
        BusMessage::SessionUpdate {
            session_id: OLD_ID.to_string(),
            timestamp: now_millis() - DAY_MS,
        },
    );

    assert!(!listener.sync());
    assert_eq!(listener.get_or_create(), own);
}

#[test]
fn invalid_broadcast_is_ignored() {
    let bus = SessionBus::detached("session-test-invalid");
    let mut listener = SessionManager::new(Vec::new()).with_bus(bus.clone());
    let own = listener.get_or_create();

    let announcer = bus.subscribe();
    bus.publish(
        &announcer,
        BusMessage::SessionUpdate {
            session_id: "short".to_string(),
            timestamp: now_millis() + 1_000,
        },
    );
    assert_eq!(listener.get_or_create(), own);
}

#[test]
fn managers_converge_through_create_and_refresh() {
    let bus = SessionBus::detached("session-test-converge");
    let store_a = memory_tier("a");
    let store_b = memory_tier("b");
    let mut tab_a = SessionManager::new(tiers(&[&store_a])).with_bus(bus.clone());
    let mut tab_b = SessionManager::new(tiers(&[&store_b])).with_bus(bus.clone());

    let created = tab_a.get_or_create();
    assert_eq!(tab_b.get_or_create(), created);
    assert_eq!(store_b.get(SESSION_ID_KEY).unwrap(), Some(created.clone()));

    let refreshed = tab_b.refresh();
    assert_ne!(refreshed, created);
    assert_eq!(tab_a.get_or_create(), refreshed);
    assert_eq!(store_a.get(SESSION_ID_KEY).unwrap(), Some(refreshed));
}

#[test]
fn managers_without_a_common_bus_converge_through_shared_storage() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = docchat::config::Config {
        data_dir: tmp.path().join("data"),
        session_dir: tmp.path().join("run"),
        ..Default::default()
    };
    let mut chat_window = SessionManager::from_config(&config)
        .with_bus(SessionBus::detached("session-test-shared-a"));
    let mut other_terminal = SessionManager::from_config(&config)
        .with_bus(SessionBus::detached("session-test-shared-b"));

    let original = chat_window.get_or_create();
    assert_eq!(other_terminal.get_or_create(), original);

    let refreshed = other_terminal.refresh();
    assert_ne!(refreshed, original);
    assert_eq!(chat_window.get_or_create(), refreshed);
    assert_eq!(chat_window.info().tier, "durable");
}

#[test]
fn older_record_in_shared_storage_does_not_replace_cached_id() {
    let durable = memory_tier("durable");
    let mut manager = SessionManager::new(tiers(&[&durable]));
    let own = manager.get_or_create();

    seed(&durable, OLD_ID, now_millis() - DAY_MS);

    assert!(!manager.sync());
    assert_eq!(manager.get_or_create(), own);
}

#[test]
fn from_config_uses_configured_directories() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = docchat::config::Config {
        data_dir: tmp.path().join("data"),
        session_dir: tmp.path().join("run"),
        channel: "session-test-config".to_string(),
        ..Default::default()
    };

    let id = SessionManager::from_config(&config).get_or_create();
    let durable = FileStore::new("durable", config.durable_store_path());
    let session = FileStore::new("session", config.session_store_path());
    assert_eq!(durable.get(SESSION_ID_KEY).unwrap(), Some(id));
    assert!(session.get(SESSION_BACKUP_KEY).unwrap().is_some());
}
