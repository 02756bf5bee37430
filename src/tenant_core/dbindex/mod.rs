use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde_json::Value as SettingValue;

use crate::tenant_core::common::{Error, Result};

/// One database's introspected state, as last observed from the system database. Immutable
/// once built; `register_db` swaps the whole entry rather than mutating it in place, so a
/// reader holding an `Arc<DatabaseEntry>` never sees a torn update.
///
/// `user_schema_pickle`, `db_config`, `reflection_cache` and `backend_ids` are all `None`
/// for an entry created by early introspection: that pass only learns `extensions`, enough
/// to admit connections before the full schema is parsed.
#[derive(Clone, Debug, Default)]
pub struct DatabaseEntry {
    pub name: String,
    pub dbver: u64,
    pub user_schema_pickle: Option<Arc<Vec<u8>>>,
    pub db_config: Option<Arc<HashMap<String, SettingValue>>>,
    pub reflection_cache: Option<Arc<HashMap<String, Vec<String>>>>,
    pub backend_ids: Option<Arc<HashMap<String, String>>>,
    pub extensions: Arc<HashSet<String>>,
    pub ext_config_settings: Option<Arc<SettingValue>>,
}

impl DatabaseEntry {
    pub fn new(name: impl Into<String>) -> Self {
        DatabaseEntry {
            name: name.into(),
            ..Default::default()
        }
    }

    fn next(&self, fields: DatabaseEntryFields) -> Self {
        DatabaseEntry {
            name: self.name.clone(),
            dbver: self.dbver + 1,
            user_schema_pickle: fields.user_schema_pickle,
            db_config: fields.db_config,
            reflection_cache: fields.reflection_cache,
            backend_ids: fields.backend_ids,
            extensions: fields.extensions,
            ext_config_settings: fields.ext_config_settings,
        }
    }
}

/// The nullable fields `register_db` may supply, grouped so early introspection (which
/// only knows `extensions`) and full introspection (which knows everything) share one call
/// shape.
#[derive(Default)]
pub struct DatabaseEntryFields {
    pub user_schema_pickle: Option<Arc<Vec<u8>>>,
    pub db_config: Option<Arc<HashMap<String, SettingValue>>>,
    pub reflection_cache: Option<Arc<HashMap<String, Vec<String>>>>,
    pub backend_ids: Option<Arc<HashMap<String, String>>>,
    pub extensions: Arc<HashSet<String>>,
    pub ext_config_settings: Option<Arc<SettingValue>>,
}

struct Snapshot {
    dbs: HashMap<String, Arc<DatabaseEntry>>,
    global_schema_pickle: Arc<Vec<u8>>,
    sys_config: Arc<HashMap<String, String>>,
    default_sys_config: Arc<HashMap<String, String>>,
    config_settings_spec: Arc<SettingValue>,
    std_schema: Arc<Vec<u8>>,
}

/// In-memory index of every database this tenant serves, plus the tenant-wide global
/// schema and system config. Readers see a consistent, immutable snapshot taken with one
/// atomic load; writers install a whole new snapshot rather than lock readers out.
pub struct DbIndex {
    snapshot: ArcSwap<Snapshot>,
    view_counts: Mutex<HashMap<String, u64>>,
}

impl DbIndex {
    pub fn new() -> Self {
        DbIndex {
            snapshot: ArcSwap::from_pointee(Snapshot {
                dbs: HashMap::new(),
                global_schema_pickle: Arc::new(Vec::new()),
                sys_config: Arc::new(HashMap::new()),
                default_sys_config: Arc::new(HashMap::new()),
                config_settings_spec: Arc::new(SettingValue::Null),
                std_schema: Arc::new(Vec::new()),
            }),
            view_counts: Mutex::new(HashMap::new()),
        }
    }

    fn rcu_dbs(&self, f: impl FnOnce(&mut HashMap<String, Arc<DatabaseEntry>>)) {
        self.snapshot.rcu(|snap| {
            let mut dbs = snap.dbs.clone();
            f(&mut dbs);
            Arc::new(Snapshot {
                dbs,
                global_schema_pickle: snap.global_schema_pickle.clone(),
                sys_config: snap.sys_config.clone(),
                default_sys_config: snap.default_sys_config.clone(),
                config_settings_spec: snap.config_settings_spec.clone(),
                std_schema: snap.std_schema.clone(),
            })
        });
    }

    /// Creates or replaces `name`'s entry, bumping `dbver`. Nullable fields permit the
    /// early-introspection path that only learns `extensions`.
    pub fn register_db(&self, name: &str, fields: DatabaseEntryFields) -> Arc<DatabaseEntry> {
        let mut installed = None;
        self.rcu_dbs(|dbs| {
            let entry = match dbs.get(name) {
                Some(existing) => existing.next(DatabaseEntryFields {
                    user_schema_pickle: fields.user_schema_pickle.clone(),
                    db_config: fields.db_config.clone(),
                    reflection_cache: fields.reflection_cache.clone(),
                    backend_ids: fields.backend_ids.clone(),
                    extensions: fields.extensions.clone(),
                    ext_config_settings: fields.ext_config_settings.clone(),
                }),
                None => DatabaseEntry {
                    name: name.to_string(),
                    dbver: 0,
                    user_schema_pickle: fields.user_schema_pickle.clone(),
                    db_config: fields.db_config.clone(),
                    reflection_cache: fields.reflection_cache.clone(),
                    backend_ids: fields.backend_ids.clone(),
                    extensions: fields.extensions.clone(),
                    ext_config_settings: fields.ext_config_settings.clone(),
                },
            };
            let entry = Arc::new(entry);
            installed = Some(entry.clone());
            dbs.insert(name.to_string(), entry);
        });
        installed.expect("rcu_dbs always runs its closure")
    }

    /// Drops `name`'s entry; any live views become invalid — a view cannot outlive its
    /// DatabaseEntry.
    pub fn unregister_db(&self, name: &str) {
        self.rcu_dbs(|dbs| {
            dbs.remove(name);
        });
        self.view_counts.lock().unwrap().remove(name);
    }

    pub fn has_db(&self, name: &str) -> bool {
        self.snapshot.load().dbs.contains_key(name)
    }

    pub fn maybe_get_db(&self, name: &str) -> Option<Arc<DatabaseEntry>> {
        self.snapshot.load().dbs.get(name).cloned()
    }

    pub fn get_db(&self, name: &str) -> Result<Arc<DatabaseEntry>> {
        self.maybe_get_db(name)
            .ok_or_else(|| Error::execution(format!("database \"{}\" is not registered", name)))
    }

    pub fn iter_dbs(&self) -> Vec<Arc<DatabaseEntry>> {
        self.snapshot.load().dbs.values().cloned().collect()
    }

    pub fn update_global_schema(&self, pickle: Vec<u8>) {
        let pickle = Arc::new(pickle);
        self.snapshot.rcu(|snap| {
            Arc::new(Snapshot {
                dbs: snap.dbs.clone(),
                global_schema_pickle: pickle.clone(),
                sys_config: snap.sys_config.clone(),
                default_sys_config: snap.default_sys_config.clone(),
                config_settings_spec: snap.config_settings_spec.clone(),
                std_schema: snap.std_schema.clone(),
            })
        });
    }

    pub fn get_global_schema_pickle(&self) -> Arc<Vec<u8>> {
        self.snapshot.load().global_schema_pickle.clone()
    }

    pub fn update_sys_config(&self, cfg: HashMap<String, String>) {
        let cfg = Arc::new(cfg);
        self.snapshot.rcu(|snap| {
            Arc::new(Snapshot {
                dbs: snap.dbs.clone(),
                global_schema_pickle: snap.global_schema_pickle.clone(),
                sys_config: cfg.clone(),
                default_sys_config: snap.default_sys_config.clone(),
                config_settings_spec: snap.config_settings_spec.clone(),
                std_schema: snap.std_schema.clone(),
            })
        });
    }

    /// Returns the most recently committed `sys_config`.
    pub fn get_sys_config(&self) -> Arc<HashMap<String, String>> {
        self.snapshot.load().sys_config.clone()
    }

    pub fn set_default_sys_config(&self, cfg: HashMap<String, String>) {
        let cfg = Arc::new(cfg);
        self.snapshot.rcu(|snap| {
            Arc::new(Snapshot {
                dbs: snap.dbs.clone(),
                global_schema_pickle: snap.global_schema_pickle.clone(),
                sys_config: snap.sys_config.clone(),
                default_sys_config: cfg.clone(),
                config_settings_spec: snap.config_settings_spec.clone(),
                std_schema: snap.std_schema.clone(),
            })
        });
    }

    pub fn get_default_sys_config(&self) -> Arc<HashMap<String, String>> {
        self.snapshot.load().default_sys_config.clone()
    }

    pub fn set_config_settings_spec(&self, spec: SettingValue) {
        let spec = Arc::new(spec);
        self.snapshot.rcu(|snap| {
            Arc::new(Snapshot {
                dbs: snap.dbs.clone(),
                global_schema_pickle: snap.global_schema_pickle.clone(),
                sys_config: snap.sys_config.clone(),
                default_sys_config: snap.default_sys_config.clone(),
                config_settings_spec: spec.clone(),
                std_schema: snap.std_schema.clone(),
            })
        });
    }

    pub fn get_config_settings_spec(&self) -> Arc<SettingValue> {
        self.snapshot.load().config_settings_spec.clone()
    }

    pub fn set_std_schema(&self, pickle: Vec<u8>) {
        let pickle = Arc::new(pickle);
        self.snapshot.rcu(|snap| {
            Arc::new(Snapshot {
                dbs: snap.dbs.clone(),
                global_schema_pickle: snap.global_schema_pickle.clone(),
                sys_config: snap.sys_config.clone(),
                default_sys_config: snap.default_sys_config.clone(),
                config_settings_spec: snap.config_settings_spec.clone(),
                std_schema: pickle.clone(),
            })
        });
    }

    pub fn get_std_schema(&self) -> Arc<Vec<u8>> {
        self.snapshot.load().std_schema.clone()
    }

    /// Registers one active reference against `name`, used to track whether a database has
    /// any live sessions bound to it (read by `ensure_database_not_connected`).
    pub fn new_view(&self, name: &str) -> View<'_> {
        let mut counts = self.view_counts.lock().unwrap();
        *counts.entry(name.to_string()).or_insert(0) += 1;
        View {
            index: self,
            dbname: name.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live views against `name`.
    pub fn count_connections(&self, name: &str) -> u64 {
        *self.view_counts.lock().unwrap().get(name).unwrap_or(&0)
    }

    fn remove_view(&self, name: &str) {
        let mut counts = self.view_counts.lock().unwrap();
        if let Some(count) = counts.get_mut(name) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Default for DbIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// A live reference against one database, held for as long as a client session is bound to
/// it. Decrements the index's connection count on drop.
pub struct View<'a> {
    index: &'a DbIndex,
    dbname: String,
    closed: AtomicBool,
}

impl View<'_> {
    pub fn dbname(&self) -> &str {
        &self.dbname
    }
}

impl Drop for View<'_> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.index.remove_view(&self.dbname);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extensions(names: &[&str]) -> Arc<HashSet<String>> {
        Arc::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn register_and_lookup_roundtrip() {
        let index = DbIndex::new();
        assert!(!index.has_db("foo"));
        index.register_db(
            "foo",
            DatabaseEntryFields {
                extensions: extensions(&["graphql"]),
                ..Default::default()
            },
        );
        assert!(index.has_db("foo"));
        let entry = index.get_db("foo").unwrap();
        assert_eq!(entry.dbver, 0);
        assert!(entry.extensions.contains("graphql"));
    }

    /// `register_db(name, X); register_db(name, X); get_db(name)` returns an entry equal
    /// to X in observable content — `dbver` still advances on every call, since it's
    /// monotonic rather than content-keyed.
    #[test]
    fn re_registering_with_identical_fields_is_idempotent_in_content() {
        let index = DbIndex::new();
        let exts = extensions(&["graphql"]);
        index.register_db(
            "foo",
            DatabaseEntryFields {
                extensions: exts.clone(),
                ..Default::default()
            },
        );
        index.register_db(
            "foo",
            DatabaseEntryFields {
                extensions: exts.clone(),
                ..Default::default()
            },
        );
        let entry = index.get_db("foo").unwrap();
        assert_eq!(entry.extensions, exts);
    }

    #[test]
    fn early_introspection_leaves_schema_fields_null() {
        let index = DbIndex::new();
        index.register_db(
            "foo",
            DatabaseEntryFields {
                extensions: extensions(&[]),
                ..Default::default()
            },
        );
        let entry = index.get_db("foo").unwrap();
        assert!(entry.user_schema_pickle.is_none());
        assert!(entry.db_config.is_none());
    }

    #[test]
    fn full_introspection_bumps_dbver_and_fills_in_schema() {
        let index = DbIndex::new();
        index.register_db(
            "foo",
            DatabaseEntryFields {
                extensions: extensions(&[]),
                ..Default::default()
            },
        );
        index.register_db(
            "foo",
            DatabaseEntryFields {
                user_schema_pickle: Some(Arc::new(vec![1, 2, 3])),
                extensions: extensions(&["graphql"]),
                ..Default::default()
            },
        );
        let entry = index.get_db("foo").unwrap();
        assert_eq!(entry.dbver, 1);
        assert_eq!(entry.user_schema_pickle.as_deref(), Some(&vec![1, 2, 3]));
    }

    /// `unregister_db(name); unregister_db(name)` is a no-op.
    #[test]
    fn unregister_is_idempotent() {
        let index = DbIndex::new();
        index.register_db("foo", DatabaseEntryFields::default());
        index.unregister_db("foo");
        index.unregister_db("foo");
        assert!(!index.has_db("foo"));
    }

    #[test]
    fn view_counts_track_registrations_and_drops() {
        let index = DbIndex::new();
        index.register_db("foo", DatabaseEntryFields::default());
        let view = index.new_view("foo");
        assert_eq!(index.count_connections("foo"), 1);
        drop(view);
        assert_eq!(index.count_connections("foo"), 0);
        index.unregister_db("foo");
        assert!(!index.has_db("foo"));
    }

    #[test]
    fn missing_db_is_an_execution_error() {
        let index = DbIndex::new();
        assert!(index.get_db("nope").is_err());
        assert!(index.maybe_get_db("nope").is_none());
    }

    #[test]
    fn sys_config_reads_the_most_recently_committed_value() {
        let index = DbIndex::new();
        index.update_sys_config([("shared_buffers".to_string(), "256MB".to_string())].into_iter().collect());
        assert_eq!(index.get_sys_config().get("shared_buffers").map(String::as_str), Some("256MB"));
        index.update_sys_config([("shared_buffers".to_string(), "512MB".to_string())].into_iter().collect());
        assert_eq!(index.get_sys_config().get("shared_buffers").map(String::as_str), Some("512MB"));
    }
}
