use super::{entries, entry_key, single_member, CrudEngine, Scope};
use crate::callbacks::{NodeEvent, Notifier};
use crate::error::{DalError, Result};
use crate::path::{self, Segment};
use crate::resolver::{at, at_mut, Cursor, Partition};
use crate::schema::{NodeKind, TableInfo};
use serde_json::{Map, Value};

/// Result of a replace request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The target did not exist and was created below its parent
    Created,
    /// The target existed and was merged with the body
    Replaced,
}

impl PutOutcome {
    pub fn status_code(self) -> u16 {
        match self {
            PutOutcome::Created => 201,
            PutOutcome::Replaced => 204,
        }
    }
}

impl<'a> CrudEngine<'a> {
    /// Replace the node at `data_path` with `body`, touching only what differs.
    pub(crate) fn put<C>(&self, data_path: &str, body: Value, notifier: &mut Notifier<'_, C>) -> Result<PutOutcome> {
        path::validate(data_path)?;
        match self.resolver().resolve(data_path, Partition::Config)? {
            Some(cursor) => {
                self.replace(cursor, body, notifier)?;
                Ok(PutOutcome::Replaced)
            }
            None => {
                self.create_missing(data_path, body, notifier)?;
                Ok(PutOutcome::Created)
            }
        }
    }

    fn create_missing<C>(&self, data_path: &str, body: Value, notifier: &mut Notifier<'_, C>) -> Result<()> {
        let Some((parent_path, last)) = path::split_last(data_path) else {
            return Err(DalError::InvalidTarget("The root always exists".into()));
        };
        let segment = Segment::parse(last);
        let mut parent = self
            .resolver()
            .resolve(parent_path, Partition::Config)?
            .ok_or_else(|| DalError::ParentNodeNotFound(parent_path.to_string()))?;
        let name = self
            .registry
            .member_name(&parent.schema_path, segment.name)
            .ok_or_else(|| DalError::InvalidTarget(format!("Unknown node {data_path}")))?;
        let schema_path = path::join(&parent.schema_path, name);
        let value = unwrap_body(&schema_path, body)?;

        if let Some(key) = segment.key {
            let table = self.table(&schema_path)?;
            let found = match &value {
                Value::Array(items) if items.len() == 1 => entry_key(table, &items[0])?,
                Value::Object(_) => entry_key(table, &value)?,
                _ => {
                    return Err(DalError::MalformedBody(format!(
                        "Expected one entry of {schema_path}"
                    )))
                }
            };
            if found != key {
                return Err(DalError::InvalidTarget(format!(
                    "Key '{found}' in body does not match {data_path}"
                )));
            }
        }

        self.create_child(&mut parent, name, value, notifier)?;
        self.changed_and_persist(&mut parent, notifier)
    }

    fn replace<C>(&self, mut cursor: Cursor, body: Value, notifier: &mut Notifier<'_, C>) -> Result<()> {
        let scope = Scope {
            row_id: cursor.row_id,
            root_path: &cursor.root_path,
        };

        let changed = if cursor.schema_path == path::ROOT {
            self.compare_map(
                &mut cursor.document,
                &mut Vec::new(),
                path::ROOT,
                path::ROOT,
                body,
                scope,
                notifier,
            )?
        } else if cursor.is_entry() {
            let table = self.table(&cursor.schema_path)?;
            let mut items = entries(unwrap_body(&cursor.schema_path, body)?)?;
            if items.len() != 1 {
                return Err(DalError::MalformedBody(format!(
                    "Expected one entry of {}, found {}",
                    cursor.schema_path,
                    items.len()
                )));
            }
            let entry = items.remove(0);
            let key = entry_key(table, &entry)?;
            if cursor.entry_key() != Some(key.as_str()) {
                return Err(DalError::InvalidTarget(format!(
                    "Key '{key}' in body does not match {}",
                    cursor.data_path
                )));
            }
            self.compare_map(
                &mut cursor.document,
                &mut Vec::new(),
                &cursor.schema_path,
                &cursor.data_path,
                entry,
                scope,
                notifier,
            )?
        } else {
            let value = unwrap_body(&cursor.schema_path, body)?;
            let mut pointer = cursor.pointer.clone();
            self.compare_node(
                &mut cursor.document,
                &mut pointer,
                &cursor.schema_path,
                &cursor.data_path,
                value,
                scope,
                notifier,
            )?
        };

        if changed {
            self.persist(&cursor)?;
        }
        Ok(())
    }

    /// Compare the node at `pointer` with its replacement. Returns true when
    /// anything at or below it changed.
    #[allow(clippy::too_many_arguments)]
    fn compare_node<C>(
        &self,
        document: &mut Value,
        pointer: &mut Vec<String>,
        schema_path: &str,
        data_path: &str,
        replacement: Value,
        scope: Scope<'_>,
        notifier: &mut Notifier<'_, C>,
    ) -> Result<bool> {
        if self.registry.kind(schema_path)? != NodeKind::Leaf {
            return self.compare_map(document, pointer, schema_path, data_path, replacement, scope, notifier);
        }

        let current = at_mut(document, pointer)
            .ok_or_else(|| DalError::NodeNotFound(data_path.to_string()))?;
        if *current == replacement {
            return Ok(false);
        }
        *current = replacement;
        fire_changed(document, schema_path, data_path, scope, notifier)?;
        Ok(true)
    }

    /// Merge a container (or a list entry) with its replacement: create
    /// added members, delete removed ones, recurse into common ones.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn compare_map<C>(
        &self,
        document: &mut Value,
        pointer: &mut Vec<String>,
        schema_path: &str,
        data_path: &str,
        replacement: Value,
        scope: Scope<'_>,
        notifier: &mut Notifier<'_, C>,
    ) -> Result<bool> {
        let Value::Object(members) = replacement else {
            return Err(DalError::MalformedBody(format!(
                "{data_path} must be an object"
            )));
        };
        let mut incoming = Map::new();
        for (member, value) in members {
            let name = self
                .registry
                .member_name(schema_path, &member)
                .ok_or_else(|| {
                    DalError::MalformedBody(format!("'{member}' is not a child of {schema_path}"))
                })?
                .to_string();
            if self.registry.is_config_false(&path::join(schema_path, &name)) {
                return Err(DalError::InvalidTarget(format!(
                    "{} is config false",
                    path::join(data_path, &name)
                )));
            }
            incoming.insert(name, value);
        }

        let mut changed = false;

        for table in self.registry.child_list_tables(schema_path) {
            let Some((_, name)) = path::split_last(&table.schema_path) else {
                continue;
            };
            let value = incoming.remove(name).unwrap_or_else(|| Value::Array(Vec::new()));
            let list_path = path::join(data_path, name);
            changed |= self.compare_list(table, scope.row_id, &list_path, value, notifier)?;
        }

        let current: Vec<String> = match at(document, pointer) {
            Some(Value::Object(members)) => members.keys().cloned().collect(),
            Some(_) => {
                return Err(DalError::InvalidTarget(format!(
                    "{data_path} is not a container"
                )))
            }
            None => return Err(DalError::NodeNotFound(data_path.to_string())),
        };

        for name in &current {
            if incoming.contains_key(name) {
                continue;
            }
            let child_schema = path::join(schema_path, name);
            // Operational data is left alone by a config replace.
            if self.registry.is_config_false(&child_schema) || self.registry.node(&child_schema).is_none() {
                continue;
            }
            let removed = at_mut(document, pointer)
                .and_then(Value::as_object_mut)
                .and_then(|members| members.remove(name));
            if let Some(value) = removed {
                let child_data = path::join(data_path, name);
                self.delete_subtree(scope.row_id, &child_data, &child_schema, &value, notifier)?;
                changed = true;
            }
        }

        for (name, value) in incoming {
            let child_schema = path::join(schema_path, &name);
            let child_data = path::join(data_path, &name);
            let exists = current.contains(&name);
            pointer.push(name);
            let result = if exists {
                self.compare_node(document, pointer, &child_schema, &child_data, value, scope, notifier)
            } else {
                self.create_in_document(document, pointer, &child_schema, &child_data, value, scope, notifier)
                    .map(|()| true)
            };
            pointer.pop();
            changed |= result?;
        }

        if changed {
            fire_changed(document, schema_path, data_path, scope, notifier)?;
        }
        Ok(changed)
    }

    /// Bring the rows of `table` under `parent_id` in line with `value`.
    /// Returns true when entries were added or removed; entries that merely
    /// changed fire their own notifications.
    pub(super) fn compare_list<C>(
        &self,
        table: &TableInfo,
        parent_id: i64,
        list_path: &str,
        value: Value,
        notifier: &mut Notifier<'_, C>,
    ) -> Result<bool> {
        let mut incoming: Vec<(String, Value)> = Vec::new();
        for entry in entries(value)? {
            let key = entry_key(table, &entry)?;
            if incoming.iter().any(|(k, _)| *k == key) {
                return Err(DalError::MalformedBody(format!(
                    "Duplicate key '{key}' in {list_path}"
                )));
            }
            incoming.push((key, entry));
        }

        let existing = self.storage.rows_for_parent(table, parent_id)?;
        let mut changed = false;

        for row in &existing {
            let key = row.key.as_deref().unwrap_or_default();
            if !incoming.iter().any(|(k, _)| k == key) {
                let entry_path = format!("{list_path}={key}");
                self.delete_entry(table, row.id, &row.document, &entry_path, notifier)?;
                changed = true;
            }
        }

        for (key, entry) in incoming {
            let Some(row) = existing.iter().find(|r| r.key.as_deref() == Some(key.as_str())) else {
                self.insert_entry(table, parent_id, list_path, entry, notifier)?;
                changed = true;
                continue;
            };

            let entry_path = format!("{list_path}={key}");
            let mut document = row.document.clone();
            let scope = Scope {
                row_id: row.id,
                root_path: &entry_path,
            };
            if self.compare_map(
                &mut document,
                &mut Vec::new(),
                &table.schema_path,
                &entry_path,
                entry,
                scope,
                notifier,
            )? {
                self.storage.update_document(table, row.id, &document)?;
            }
        }

        if changed {
            log::debug!("List {list_path} membership changed");
        }
        Ok(changed)
    }
}

fn fire_changed<C>(
    document: &mut Value,
    schema_path: &str,
    data_path: &str,
    scope: Scope<'_>,
    notifier: &mut Notifier<'_, C>,
) -> Result<()> {
    let event = NodeEvent {
        data_path,
        schema_path,
        root_path: scope.root_path,
    };
    notifier.changed(&event, document)
}

/// Take the value out of a `{ "<name>": value }` body addressed at `schema_path`.
fn unwrap_body(schema_path: &str, body: Value) -> Result<Value> {
    let (member, value) = single_member(body)?;
    let expected = path::split_last(schema_path).map(|(_, last)| last).unwrap_or_default();
    if path::local_name(&member) != path::local_name(expected) {
        return Err(DalError::MalformedBody(format!(
            "Body member '{member}' does not match {schema_path}"
        )));
    }
    Ok(value)
}
