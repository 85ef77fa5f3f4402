use super::CrudEngine;
use crate::callbacks::Notifier;
use crate::error::{DalError, Result};
use crate::path::{self, Segment};
use crate::resolver::Partition;
use crate::schema::{NodeKind, TableInfo};
use serde_json::Value;

impl<'a> CrudEngine<'a> {
    /// Remove the node at `data_path` and everything below it.
    pub(crate) fn delete<C>(&self, data_path: &str, notifier: &mut Notifier<'_, C>) -> Result<()> {
        path::validate(data_path)?;
        let Some((parent_path, last)) = path::split_last(data_path) else {
            return Err(DalError::InvalidTarget("The root cannot be deleted".into()));
        };
        let not_found = || DalError::NodeNotFound(data_path.to_string());

        let mut parent = self
            .resolver()
            .resolve(parent_path, Partition::Config)?
            .ok_or_else(not_found)?;

        let segment = Segment::parse(last);
        let name = self
            .registry
            .member_name(&parent.schema_path, segment.name)
            .ok_or_else(|| DalError::InvalidTarget(format!("Unknown node {data_path}")))?
            .to_string();
        let schema_path = path::join(&parent.schema_path, &name);
        if self.registry.is_config_false(&schema_path) {
            return Err(DalError::InvalidTarget(format!(
                "{data_path} is config false"
            )));
        }
        let member_path = path::join(&parent.data_path, &name);

        match (self.registry.list_table(&schema_path), segment.key) {
            (Some(table), Some(key)) => {
                let row_id = self
                    .storage
                    .find_row(table, parent.row_id, key)?
                    .ok_or_else(not_found)?;
                let document = self.storage.load_document(table, row_id)?;
                self.delete_entry(table, row_id, &document, &format!("{member_path}={key}"), notifier)?;
            }
            (Some(table), None) => {
                let rows = self.storage.rows_for_parent(table, parent.row_id)?;
                if rows.is_empty() {
                    return Err(not_found());
                }
                for row in rows {
                    let key = row.key.as_deref().unwrap_or_default();
                    self.delete_entry(table, row.id, &row.document, &format!("{member_path}={key}"), notifier)?;
                }
            }
            (None, Some(_)) => {
                return Err(DalError::InvalidTarget(format!(
                    "{schema_path} is not a list and takes no key"
                )))
            }
            (None, None) => {
                let removed = parent
                    .node_mut()
                    .and_then(Value::as_object_mut)
                    .and_then(|members| members.remove(&name))
                    .ok_or_else(not_found)?;
                self.delete_subtree(parent.row_id, &member_path, &schema_path, &removed, notifier)?;
            }
        }

        self.changed_and_persist(&mut parent, notifier)
    }

    /// Delete a list entry row after everything below it.
    pub(super) fn delete_entry<C>(
        &self,
        table: &TableInfo,
        row_id: i64,
        document: &Value,
        entry_path: &str,
        notifier: &mut Notifier<'_, C>,
    ) -> Result<()> {
        self.delete_subtree(row_id, entry_path, &table.schema_path, document, notifier)?;
        self.storage.delete_row(table, row_id)
    }

    /// Delete the rows below a removed node, deepest first, and fire delete
    /// handlers for the node and its members. `row_id` is the row whose
    /// document held `value` (or, for an entry, the entry's own row).
    pub(super) fn delete_subtree<C>(
        &self,
        row_id: i64,
        data_path: &str,
        schema_path: &str,
        value: &Value,
        notifier: &mut Notifier<'_, C>,
    ) -> Result<()> {
        if self.registry.kind(schema_path)? != NodeKind::Leaf {
            let members = value.as_object();

            for table in self.registry.direct_subtables(schema_path) {
                let relative = path::relative_segments(schema_path, &table.schema_path);
                // Lists inside a member still present are reached through it.
                if relative.len() > 1 && members.is_some_and(|m| m.contains_key(relative[0])) {
                    continue;
                }
                let list_path = relative
                    .iter()
                    .fold(data_path.to_string(), |p, name| path::join(&p, name));

                if table.is_config() {
                    for row in self.storage.rows_for_parent(table, row_id)? {
                        let key = row.key.as_deref().unwrap_or_default();
                        let entry_path = format!("{list_path}={key}");
                        self.delete_entry(table, row.id, &row.document, &entry_path, notifier)?;
                    }
                } else {
                    let removed = self.storage.delete_rows_for_parent(table, row_id)?;
                    if removed > 0 {
                        log::debug!("Removed {removed} rows of {list_path}");
                    }
                }
            }

            if let Some(members) = members {
                for (name, child) in members {
                    let child_schema = path::join(schema_path, name);
                    if self.registry.node(&child_schema).is_none() {
                        continue;
                    }
                    let child_data = path::join(data_path, name);
                    self.delete_subtree(row_id, &child_data, &child_schema, child, notifier)?;
                }
            }
        }

        if self.registry.is_config_false(schema_path) {
            return Ok(());
        }
        notifier.deleted(schema_path, data_path)
    }
}
