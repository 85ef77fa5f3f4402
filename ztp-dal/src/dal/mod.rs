use crate::callbacks::{CallbackRegistry, Notifier};
use crate::config::DalConfig;
use crate::crud::{CrudEngine, PutOutcome};
use crate::error::{DalError, Result};
use crate::migration::{diff_indexes, unsafe_changes};
use crate::path;
use crate::registry::TableRegistry;
use crate::resolver::Partition;
use crate::schema::{parse_schema, parse_schema_str, SchemaIndex, TableInfo};
use crate::storage::Storage;
use serde_json::{json, Map, Value};
use std::path::Path;

/// Version of the table layout written into `dal-meta`.
const DB_VERSION: i64 = 1;

const META: &str = "dal-meta";
const NAMESPACE: &str = "app-namespace";
const SCHEMA_INDEX: &str = "schema-index";
const OPAQUE: &str = "opaque";
const GLOBAL_ROOT: &str = "global-root";

/// A schema-driven datastore. Every public operation runs in its own
/// SQLite transaction; a failing operation or callback leaves nothing behind.
pub struct Dal {
    db: Storage,
    registry: TableRegistry,
    global_root: i64,
    opaque: Value,
}

impl Dal {
    /// Open the datastore in a data directory containing `schema.yaml` and
    /// an optional `dal.yaml`. The database is created on first open.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config = DalConfig::load(dir)?;
        Self::open_with_config(dir, config)
    }

    pub fn open_with_config(dir: impl AsRef<Path>, config: DalConfig) -> Result<Self> {
        let dir = dir.as_ref();
        config.validate()?;
        if !dir.is_dir() {
            return Err(DalError::Other(format!(
                "Data directory does not exist: {}",
                dir.display()
            )));
        }

        let schema_path = dir.join(&config.schema_file);
        if !schema_path.exists() {
            return Err(DalError::Schema(format!(
                "{} not found in {}",
                config.schema_file,
                dir.display()
            )));
        }
        let index = SchemaIndex::build(&parse_schema(&schema_path)?)?;

        let db_path = dir.join(&config.database_file);
        let exists = db_path.exists();
        let db = Storage::open(&db_path, config.busy_timeout())?;
        if exists {
            log::info!("Opening datastore {}", db_path.display());
            Self::boot(db, index)
        } else {
            log::info!("Creating datastore {}", db_path.display());
            Self::create(db, TableRegistry::new(index), &config)
        }
    }

    /// Create a datastore in memory (for testing).
    pub fn open_in_memory(schema_yaml: &str, config: DalConfig) -> Result<Self> {
        config.validate()?;
        let registry = TableRegistry::new(SchemaIndex::build(&parse_schema_str(schema_yaml)?)?);
        Self::create(Storage::open_in_memory()?, registry, &config)
    }

    /// Create every table and the well-known rows, then seed the root.
    fn create(db: Storage, registry: TableRegistry, config: &DalConfig) -> Result<Self> {
        let global_root = db.transaction(|db| {
            db.create_tables(registry.index())?;
            db.put_singleton(META, &json!({ "db_version": DB_VERSION }))?;
            db.put_singleton(NAMESPACE, &json!(registry.namespace()))?;
            db.put_singleton(SCHEMA_INDEX, &serde_json::to_value(registry.index())?)?;
            db.put_singleton(OPAQUE, &config.opaque)?;
            let root = db.put_singleton(GLOBAL_ROOT, &json!({}))?;

            if let Some(Value::Object(members)) = &config.initial_root {
                let callbacks: CallbackRegistry = CallbackRegistry::new();
                let mut unit = ();
                let mut notifier = Notifier::new(&callbacks, &mut unit);
                let engine = CrudEngine::new(&registry, db, root);
                for (name, value) in members {
                    let mut body = Map::new();
                    body.insert(name.clone(), value.clone());
                    engine.post(path::ROOT, Value::Object(body), &mut notifier)?;
                }
            }
            Ok(root)
        })?;

        Ok(Dal {
            db,
            registry,
            global_root,
            opaque: config.opaque.clone(),
        })
    }

    /// Check an existing database against the schema and load its well-known rows.
    fn boot(db: Storage, mut index: SchemaIndex) -> Result<Self> {
        let (global_root, opaque) = db.transaction(|db| {
            let meta = db
                .get_singleton(META)?
                .ok_or_else(|| DalError::Schema("Database has no dal-meta row".into()))?;
            let version = meta.document.get("db_version").and_then(Value::as_i64);
            if version != Some(DB_VERSION) {
                return Err(DalError::Schema(format!(
                    "Unsupported database version {version:?}, expected {DB_VERSION}"
                )));
            }

            let stored = db
                .get_singleton(SCHEMA_INDEX)?
                .ok_or_else(|| DalError::Schema("Database has no stored schema index".into()))?;
            let stored: SchemaIndex = serde_json::from_value(stored.document)?;
            index.adopt_table_names(&stored);
            let changes = diff_indexes(&stored, &index);
            let blocking = unsafe_changes(&changes);
            if !blocking.is_empty() {
                let reasons: Vec<String> = blocking.iter().map(|c| c.describe()).collect();
                return Err(DalError::Schema(format!(
                    "Schema file is incompatible with the database: {}",
                    reasons.join("; ")
                )));
            }
            if !changes.is_empty() {
                for change in &changes {
                    log::warn!("Schema change applied: {}", change.describe());
                }
                db.create_tables(&index)?;
                db.put_singleton(SCHEMA_INDEX, &serde_json::to_value(&index)?)?;
            }

            let root = db
                .get_singleton(GLOBAL_ROOT)?
                .ok_or_else(|| DalError::Schema("Database has no global root".into()))?;
            let opaque = db.get_singleton(OPAQUE)?.map(|r| r.document).unwrap_or(Value::Null);
            Ok((root.id, opaque))
        })?;

        Ok(Dal {
            db,
            registry: TableRegistry::new(index),
            global_root,
            opaque,
        })
    }

    fn engine<'a>(&'a self, db: &'a Storage) -> CrudEngine<'a> {
        CrudEngine::new(&self.registry, db, self.global_root)
    }

    pub fn namespace(&self) -> &str {
        self.registry.namespace()
    }

    /// The application value stored when the database was created.
    pub fn opaque(&self) -> &Value {
        &self.opaque
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Read config data at `data_path`. Config-false members are left out.
    pub fn get_config(&self, data_path: &str) -> Result<Value> {
        log::debug!("GET config {data_path}");
        self.db
            .read_transaction(|db| self.engine(db).get(data_path, Partition::Config))
    }

    /// Read config and operational data at `data_path`.
    pub fn get_operational(&self, data_path: &str) -> Result<Value> {
        log::debug!("GET operational {data_path}");
        self.db
            .read_transaction(|db| self.engine(db).get(data_path, Partition::Any))
    }

    // ── Config writes ────────────────────────────────────────────────

    /// Create the single member of `body` below `parent_path`.
    pub fn post_config<C>(
        &self,
        parent_path: &str,
        body: Value,
        callbacks: &CallbackRegistry<C>,
        opaque: &mut C,
    ) -> Result<()> {
        log::debug!("POST {parent_path}");
        self.db.transaction(|db| {
            let mut notifier = Notifier::new(callbacks, opaque);
            self.engine(db).post(parent_path, body, &mut notifier)
        })
    }

    /// Create or replace the node at `data_path`.
    pub fn put_config<C>(
        &self,
        data_path: &str,
        body: Value,
        callbacks: &CallbackRegistry<C>,
        opaque: &mut C,
    ) -> Result<PutOutcome> {
        log::debug!("PUT {data_path}");
        self.db.transaction(|db| {
            let mut notifier = Notifier::new(callbacks, opaque);
            self.engine(db).put(data_path, body, &mut notifier)
        })
    }

    /// Delete the node at `data_path` with everything below it.
    pub fn delete_config<C>(
        &self,
        data_path: &str,
        callbacks: &CallbackRegistry<C>,
        opaque: &mut C,
    ) -> Result<()> {
        log::debug!("DELETE {data_path}");
        self.db.transaction(|db| {
            let mut notifier = Notifier::new(callbacks, opaque);
            self.engine(db).delete(data_path, &mut notifier)
        })
    }

    // ── Operational writes ───────────────────────────────────────────

    /// Append rows to an operational list below `parent_path`.
    pub fn post_operational(&self, parent_path: &str, body: Value) -> Result<usize> {
        log::debug!("POST operational {parent_path}");
        self.db
            .transaction(|db| self.engine(db).post_operational(parent_path, body))
    }

    /// Set an operational node held inside a config row's document.
    pub fn put_operational(&self, data_path: &str, body: Value) -> Result<()> {
        log::debug!("PUT operational {data_path}");
        self.db
            .transaction(|db| self.engine(db).put_operational(data_path, body))
    }

    // ── Lookups ──────────────────────────────────────────────────────

    fn list_table(&self, list_schema_path: &str) -> Result<&TableInfo> {
        self.registry.list_table(list_schema_path).ok_or_else(|| {
            DalError::InvalidTarget(format!("{list_schema_path} is not a list"))
        })
    }

    /// Number of entries of a list across all parents.
    pub fn count_list_entries(&self, list_schema_path: &str) -> Result<usize> {
        let table = self.list_table(list_schema_path)?;
        self.db.read_transaction(|db| db.count_rows(table))
    }

    /// Key of the parent entry owning `key` in a globally unique list, or
    /// `None` when the list hangs off the root.
    pub fn owner_key(&self, list_schema_path: &str, key: &str) -> Result<Option<String>> {
        let table = self.list_table(list_schema_path)?;
        self.db.read_transaction(|db| {
            let (_, parent_id) = db.find_by_key(table, key)?.ok_or_else(|| {
                DalError::NodeNotFound(format!("{list_schema_path}={key}"))
            })?;
            let parent = self.registry.table(table.parent.as_deref().unwrap_or(path::ROOT))?;
            if parent.parent.is_none() {
                return Ok(None);
            }
            Ok(db.parent_and_key(parent, parent_id)?.map(|(_, owner)| owner))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE;
    use crate::schema::TEST_SCHEMA;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const OWNED_SCHEMA: &str = r#"
namespace: ztp
nodes:
  - name: "ztp:tenants"
    kind: container
    children:
      - name: tenant
        kind: list
        key: name
        children:
          - { name: name, kind: leaf }
          - name: device
            kind: list
            key: serial-number
            globally_unique: true
            children:
              - { name: serial-number, kind: leaf }
"#;

    fn setup_dir(dal_yaml: &str) -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("schema.yaml"), TEST_SCHEMA).unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), dal_yaml).unwrap();
        tmp
    }

    #[test]
    fn test_create_then_reopen() {
        let tmp = setup_dir("opaque: { mode: '1' }\ninitial_root:\n  \"ztp:devices\": {}\n");
        let none: CallbackRegistry = CallbackRegistry::new();
        {
            let dal = Dal::open(tmp.path()).unwrap();
            assert_eq!(dal.namespace(), "ztp");
            assert_eq!(dal.opaque(), &json!({"mode": "1"}));
            dal.post_config(
                "/ztp:devices",
                json!({"ztp:device": {"serial-number": "SN1", "interface": [{"name": "eth0"}]}}),
                &none,
                &mut (),
            )
            .unwrap();
        }
        assert!(tmp.path().join("_dal.db").exists());

        // The stored opaque value wins over a later dal.yaml.
        std::fs::write(tmp.path().join(CONFIG_FILE), "opaque: { mode: '2' }\n").unwrap();
        let dal = Dal::open(tmp.path()).unwrap();
        assert_eq!(dal.opaque(), &json!({"mode": "1"}));
        assert_eq!(
            dal.get_config("/ztp:devices").unwrap(),
            json!({"ztp:devices": {"device": [{
                "serial-number": "SN1",
                "interface": [{"name": "eth0"}]
            }]}})
        );
    }

    #[test]
    fn test_reopen_rejects_incompatible_schema() {
        let tmp = setup_dir("");
        drop(Dal::open(tmp.path()).unwrap());

        let changed = TEST_SCHEMA.replace("          - { name: ip, kind: leaf }\n", "");
        std::fs::write(tmp.path().join("schema.yaml"), changed).unwrap();
        match Dal::open(tmp.path()) {
            Err(DalError::Schema(message)) => assert!(message.contains("/ztp:devices/device/ip")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("schema change was accepted"),
        }
    }

    #[test]
    fn test_reopen_applies_added_list() {
        let tmp = setup_dir("initial_root:\n  \"ztp:preferences\": {}\n");
        drop(Dal::open(tmp.path()).unwrap());

        let extended = TEST_SCHEMA.replace(
            "      - { name: greeting, kind: leaf }",
            "      - { name: greeting, kind: leaf }\n      - name: alias\n        kind: list\n        key: id\n        children:\n          - { name: id, kind: leaf }",
        );
        std::fs::write(tmp.path().join("schema.yaml"), extended).unwrap();
        let dal = Dal::open(tmp.path()).unwrap();
        let none: CallbackRegistry = CallbackRegistry::new();
        dal.post_config("/ztp:preferences", json!({"alias": {"id": "a"}}), &none, &mut ())
            .unwrap();
        assert_eq!(dal.count_list_entries("/ztp:preferences/alias").unwrap(), 1);

        // The new index was stored: a third open sees no changes.
        drop(dal);
        Dal::open(tmp.path()).unwrap();
    }

    #[test]
    fn test_reopen_keeps_table_names_when_a_list_is_inserted() {
        let tmp = setup_dir("initial_root:\n  \"ztp:preferences\": {}\n");
        let with_alias = TEST_SCHEMA.replace(
            "      - { name: greeting, kind: leaf }",
            "      - { name: greeting, kind: leaf }\n      - name: alias\n        kind: list\n        key: id\n        children:\n          - { name: id, kind: leaf }",
        );
        std::fs::write(tmp.path().join("schema.yaml"), &with_alias).unwrap();
        let none: CallbackRegistry = CallbackRegistry::new();
        {
            let dal = Dal::open(tmp.path()).unwrap();
            dal.post_config("/ztp:preferences", json!({"alias": {"id": "a"}}), &none, &mut ())
                .unwrap();
        }

        // "ztp:preferences/alias-group" shares the initials of the existing list
        // and comes first in the schema.
        let inserted = with_alias.replace(
            "      - name: alias\n",
            "      - name: alias-group\n        kind: list\n        key: id\n        children:\n          - { name: id, kind: leaf }\n      - name: alias\n",
        );
        std::fs::write(tmp.path().join("schema.yaml"), inserted).unwrap();
        let dal = Dal::open(tmp.path()).unwrap();
        assert_eq!(
            dal.registry().table("/ztp:preferences/alias").unwrap().name,
            "pa"
        );
        assert_eq!(dal.count_list_entries("/ztp:preferences/alias").unwrap(), 1);
        dal.post_config("/ztp:preferences", json!({"alias-group": {"id": "g"}}), &none, &mut ())
            .unwrap();
        assert_eq!(dal.count_list_entries("/ztp:preferences/alias-group").unwrap(), 1);

        drop(dal);
        Dal::open(tmp.path()).unwrap();
    }

    #[test]
    fn test_open_errors() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(Dal::open(tmp.path()), Err(DalError::Schema(_))));
        assert!(matches!(
            Dal::open(tmp.path().join("missing")),
            Err(DalError::Other(_))
        ));

        let config = DalConfig {
            initial_root: Some(json!({"ztp:unknown": {}})),
            ..DalConfig::default()
        };
        assert!(matches!(
            Dal::open_in_memory(TEST_SCHEMA, config),
            Err(DalError::MalformedBody(_))
        ));
    }

    #[test]
    fn test_initial_root_is_seeded() {
        let config = DalConfig {
            initial_root: Some(json!({
                "ztp:devices": {"device": [{"serial-number": "S", "settings": {"mode": "auto"}}]},
                "ztp:preferences": {"greeting": "hello"}
            })),
            ..DalConfig::default()
        };
        let dal = Dal::open_in_memory(TEST_SCHEMA, config).unwrap();
        assert_eq!(
            dal.get_config("/").unwrap(),
            json!({
                "ztp:devices": {"device": [{"serial-number": "S", "settings": {"mode": "auto"}}]},
                "ztp:preferences": {"greeting": "hello"}
            })
        );
        assert_eq!(dal.opaque(), &Value::Null);
    }

    #[test]
    fn test_owner_key_and_counts() {
        let dal = Dal::open_in_memory(OWNED_SCHEMA, DalConfig::default()).unwrap();
        let none: CallbackRegistry = CallbackRegistry::new();
        dal.post_config("/", json!({"ztp:tenants": {}}), &none, &mut ()).unwrap();
        for tenant in ["acme", "globex"] {
            dal.post_config("/ztp:tenants", json!({"tenant": {"name": tenant}}), &none, &mut ())
                .unwrap();
        }
        dal.post_config(
            "/ztp:tenants/tenant=acme",
            json!({"device": [{"serial-number": "X1"}]}),
            &none,
            &mut (),
        )
        .unwrap();

        // Globally unique: the same serial under another tenant is a conflict.
        let err = dal
            .post_config(
                "/ztp:tenants/tenant=globex",
                json!({"device": [{"serial-number": "X1"}]}),
                &none,
                &mut (),
            )
            .unwrap_err();
        assert!(matches!(err, DalError::NodeAlreadyExists(_)));
        // And it is not visible through the other tenant.
        assert!(matches!(
            dal.get_config("/ztp:tenants/tenant=globex/device=X1"),
            Err(DalError::NodeNotFound(_))
        ));

        assert_eq!(
            dal.owner_key("/ztp:tenants/tenant/device", "X1").unwrap().as_deref(),
            Some("acme")
        );
        assert_eq!(dal.owner_key("/ztp:tenants/tenant", "acme").unwrap_err().status_code(), 400);
        assert!(matches!(
            dal.owner_key("/ztp:tenants/tenant/device", "nope"),
            Err(DalError::NodeNotFound(_))
        ));
        assert_eq!(dal.count_list_entries("/ztp:tenants/tenant").unwrap(), 2);
        assert_eq!(dal.count_list_entries("/ztp:tenants/tenant/device").unwrap(), 1);
        assert!(matches!(
            dal.count_list_entries("/ztp:tenants"),
            Err(DalError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_owner_key_at_root_is_none() {
        let dal = Dal::open_in_memory(TEST_SCHEMA, DalConfig::default()).unwrap();
        let none: CallbackRegistry = CallbackRegistry::new();
        dal.post_config("/", json!({"ztp:devices": {"device": {"serial-number": "R"}}}), &none, &mut ())
            .unwrap();
        assert_eq!(dal.owner_key("/ztp:devices/device", "R").unwrap(), None);
    }
}
