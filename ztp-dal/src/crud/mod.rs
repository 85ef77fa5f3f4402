mod create;
mod delete;
mod get;
mod operational;
mod put;

pub use put::PutOutcome;

use crate::callbacks::{NodeEvent, Notifier};
use crate::error::{DalError, Result};
use crate::registry::TableRegistry;
use crate::resolver::{Cursor, PathResolver};
use crate::schema::TableInfo;
use crate::storage::Storage;
use serde_json::{Map, Value};

/// Runs CRUD operations against one open transaction.
pub(crate) struct CrudEngine<'a> {
    registry: &'a TableRegistry,
    storage: &'a Storage,
    global_root: i64,
}

impl<'a> CrudEngine<'a> {
    pub(crate) fn new(registry: &'a TableRegistry, storage: &'a Storage, global_root: i64) -> Self {
        CrudEngine {
            registry,
            storage,
            global_root,
        }
    }

    fn resolver(&self) -> PathResolver<'a> {
        PathResolver::new(self.registry, self.storage, self.global_root)
    }

    fn table(&self, schema_path: &str) -> Result<&'a TableInfo> {
        self.registry.table(schema_path)
    }

    /// Write the cursor's table-root document back to its row.
    fn persist(&self, cursor: &Cursor) -> Result<()> {
        self.storage
            .update_document(self.table(&cursor.table)?, cursor.row_id, &cursor.document)
    }

    /// Fire the change handlers of the cursor's node, then persist its row.
    fn changed_and_persist<C>(&self, cursor: &mut Cursor, notifier: &mut Notifier<'_, C>) -> Result<()> {
        let event = NodeEvent {
            data_path: &cursor.data_path,
            schema_path: &cursor.schema_path,
            root_path: &cursor.root_path,
        };
        notifier.changed(&event, &mut cursor.document)?;
        self.persist(cursor)
    }
}

/// The table-root row a walk is working in.
#[derive(Debug, Clone, Copy)]
struct Scope<'s> {
    row_id: i64,
    root_path: &'s str,
}

/// Split a request body into its single top-level member.
fn single_member(body: Value) -> Result<(String, Value)> {
    match body {
        Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
            Some(member) => Ok(member),
            None => Err(DalError::MalformedBody("Empty body".into())),
        },
        Value::Object(map) => Err(DalError::MalformedBody(format!(
            "Expected exactly one top-level member, found {}",
            map.len()
        ))),
        other => Err(DalError::MalformedBody(format!(
            "Expected an object, found {other}"
        ))),
    }
}

/// List entries in a body: an array, or a single object standing for one entry.
fn entries(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(_) => Ok(vec![value]),
        other => Err(DalError::MalformedBody(format!(
            "Expected list entries, found {other}"
        ))),
    }
}

/// Text form of a key leaf, as stored in the key column and used in paths.
fn key_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() || text.contains('/') {
        return None;
    }
    Some(text)
}

/// Key of a list entry body.
fn entry_key(table: &TableInfo, entry: &Value) -> Result<String> {
    let key_field = table.key_field().ok_or_else(|| {
        DalError::InvalidTarget(format!("{} is not a keyed list", table.schema_path))
    })?;
    entry.get(key_field).and_then(key_text).ok_or_else(|| {
        DalError::MalformedBody(format!(
            "Entry of {} has no usable '{key_field}'",
            table.schema_path
        ))
    })
}

/// Wrap a value under a single qualified member name.
fn wrap(name: String, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(name, value);
    Value::Object(map)
}
