use super::{entries, entry_key, single_member, CrudEngine, Scope};
use crate::callbacks::{NodeEvent, Notifier};
use crate::error::{DalError, Result};
use crate::path;
use crate::resolver::{at, at_mut, Cursor, Partition};
use crate::schema::{NodeKind, TableInfo};
use serde_json::{Map, Value};

/// A config list met inside a body; its entries become rows once the
/// enclosing row exists.
struct PendingList {
    schema_path: String,
    data_path: String,
    value: Value,
}

impl<'a> CrudEngine<'a> {
    /// Create the single member of `body` below `parent_path`.
    pub(crate) fn post<C>(&self, parent_path: &str, body: Value, notifier: &mut Notifier<'_, C>) -> Result<()> {
        let (member, value) = single_member(body)?;
        let mut parent = self
            .resolver()
            .resolve(parent_path, Partition::Config)?
            .ok_or_else(|| DalError::ParentNodeNotFound(parent_path.to_string()))?;

        self.create_child(&mut parent, &member, value, notifier)?;
        self.changed_and_persist(&mut parent, notifier)
    }

    /// Add `member` below the cursor's node. In-document members are placed
    /// into the cursor's document, which the caller persists.
    pub(super) fn create_child<C>(
        &self,
        parent: &mut Cursor,
        member: &str,
        value: Value,
        notifier: &mut Notifier<'_, C>,
    ) -> Result<()> {
        let name = self
            .registry
            .member_name(&parent.schema_path, member)
            .ok_or_else(|| {
                DalError::MalformedBody(format!(
                    "'{member}' is not a child of {}",
                    parent.schema_path
                ))
            })?
            .to_string();
        let schema_path = path::join(&parent.schema_path, &name);
        if self.registry.is_config_false(&schema_path) {
            return Err(DalError::InvalidTarget(format!(
                "{schema_path} is config false"
            )));
        }
        let data_path = path::join(&parent.data_path, &name);

        if let Some(table) = self.registry.list_table(&schema_path) {
            let mut new_entries = entries(value)?;
            if new_entries.len() != 1 {
                return Err(DalError::MalformedBody(format!(
                    "Expected one entry of {schema_path}, found {}",
                    new_entries.len()
                )));
            }
            return self.insert_entry(table, parent.row_id, &data_path, new_entries.remove(0), notifier);
        }

        let exists = match parent.node() {
            Some(Value::Object(members)) => members.contains_key(&name),
            _ => {
                return Err(DalError::InvalidTarget(format!(
                    "{} cannot hold children",
                    parent.data_path
                )))
            }
        };
        if exists {
            return Err(DalError::NodeAlreadyExists(data_path));
        }

        let mut pointer = parent.pointer.clone();
        pointer.push(name);
        let scope = Scope {
            row_id: parent.row_id,
            root_path: &parent.root_path,
        };
        self.create_in_document(
            &mut parent.document,
            &mut pointer,
            &schema_path,
            &data_path,
            value,
            scope,
            notifier,
        )
    }

    /// Place a new container or leaf at `pointer`, fire create handlers for
    /// it and everything below, then insert any list entries it carried.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn create_in_document<C>(
        &self,
        document: &mut Value,
        pointer: &mut Vec<String>,
        schema_path: &str,
        data_path: &str,
        value: Value,
        scope: Scope<'_>,
        notifier: &mut Notifier<'_, C>,
    ) -> Result<()> {
        let mut lists = Vec::new();
        let value = self.split(value, schema_path, data_path, &mut lists)?;

        let Some((name, holder)) = pointer.split_last() else {
            return Err(DalError::InvalidTarget(format!("{data_path} is the root")));
        };
        at_mut(document, holder)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| DalError::ParentNodeNotFound(data_path.to_string()))?
            .insert(name.clone(), value);

        self.fire_created(document, pointer, schema_path, data_path, scope.root_path, notifier)?;
        self.insert_pending(lists, scope.row_id, notifier)
    }

    /// Insert one config list entry as a new row, then its nested lists.
    pub(super) fn insert_entry<C>(
        &self,
        table: &TableInfo,
        parent_id: i64,
        list_path: &str,
        entry: Value,
        notifier: &mut Notifier<'_, C>,
    ) -> Result<()> {
        let key = entry_key(table, &entry)?;
        let entry_path = format!("{list_path}={key}");

        let mut lists = Vec::new();
        let mut document = self.split(entry, &table.schema_path, &entry_path, &mut lists)?;
        let row_id = self.storage.insert_row(table, parent_id, &key, &document)?;

        // Handlers may stamp the new document before it is written back.
        self.fire_created(
            &mut document,
            &mut Vec::new(),
            &table.schema_path,
            &entry_path,
            &entry_path,
            notifier,
        )?;
        self.storage.update_document(table, row_id, &document)?;

        self.insert_pending(lists, row_id, notifier)
    }

    fn insert_pending<C>(&self, lists: Vec<PendingList>, row_id: i64, notifier: &mut Notifier<'_, C>) -> Result<()> {
        for pending in lists {
            let table = self.table(&pending.schema_path)?;
            for entry in entries(pending.value)? {
                self.insert_entry(table, row_id, &pending.data_path, entry, notifier)?;
            }
        }
        Ok(())
    }

    /// Normalize member names, reject config-false members, and pull config
    /// lists out of `value` into `lists`.
    fn split(
        &self,
        value: Value,
        schema_path: &str,
        data_path: &str,
        lists: &mut Vec<PendingList>,
    ) -> Result<Value> {
        if self.registry.kind(schema_path)? == NodeKind::Leaf {
            return Ok(value);
        }
        let Value::Object(members) = value else {
            return Err(DalError::MalformedBody(format!(
                "{data_path} must be an object"
            )));
        };

        let mut kept = Map::new();
        for (member, child) in members {
            let name = self
                .registry
                .member_name(schema_path, &member)
                .ok_or_else(|| {
                    DalError::MalformedBody(format!("'{member}' is not a child of {schema_path}"))
                })?
                .to_string();
            let child_schema = path::join(schema_path, &name);
            let child_data = path::join(data_path, &name);
            if self.registry.is_config_false(&child_schema) {
                return Err(DalError::InvalidTarget(format!(
                    "{child_data} is config false"
                )));
            }

            if self.registry.list_table(&child_schema).is_some() {
                lists.push(PendingList {
                    schema_path: child_schema,
                    data_path: child_data,
                    value: child,
                });
            } else {
                let child = self.split(child, &child_schema, &child_data, lists)?;
                kept.insert(name, child);
            }
        }
        Ok(Value::Object(kept))
    }

    /// Fire create handlers for the node at `pointer` and, parents first,
    /// for every member below it.
    fn fire_created<C>(
        &self,
        document: &mut Value,
        pointer: &mut Vec<String>,
        schema_path: &str,
        data_path: &str,
        root_path: &str,
        notifier: &mut Notifier<'_, C>,
    ) -> Result<()> {
        if self.registry.is_config_false(schema_path) {
            return Ok(());
        }
        let event = NodeEvent {
            data_path,
            schema_path,
            root_path,
        };
        notifier.created(&event, document)?;

        if self.registry.kind(schema_path)? == NodeKind::Leaf {
            return Ok(());
        }
        let names: Vec<String> = match at(document, pointer) {
            Some(Value::Object(members)) => members.keys().cloned().collect(),
            _ => return Ok(()),
        };
        for name in names {
            let child_schema = path::join(schema_path, &name);
            if self.registry.node(&child_schema).is_none() {
                continue;
            }
            let child_data = path::join(data_path, &name);
            pointer.push(name);
            let result = self.fire_created(document, pointer, &child_schema, &child_data, root_path, notifier);
            pointer.pop();
            result?;
        }
        Ok(())
    }
}
