use super::{wrap, CrudEngine};
use crate::error::{DalError, Result};
use crate::path;
use crate::resolver::Partition;
use crate::schema::{NodeKind, TableInfo};
use serde_json::{Map, Value};

impl<'a> CrudEngine<'a> {
    /// Read the node at `data_path` with every child-table row spliced in.
    ///
    /// The root comes back unwrapped; any other node is wrapped under its
    /// qualified name, list entries as one-element arrays.
    pub(crate) fn get(&self, data_path: &str, partition: Partition) -> Result<Value> {
        let not_found = || DalError::NodeNotFound(data_path.to_string());

        if partition == Partition::Config
            && self.registry.is_config_false(&path::schema_path(data_path))
        {
            return Err(not_found());
        }
        let cursor = self
            .resolver()
            .resolve(data_path, partition)?
            .ok_or_else(not_found)?;
        let name = self.registry.index().qualified_name(&cursor.schema_path);

        let mut node = cursor.node().cloned().ok_or_else(not_found)?;
        if partition == Partition::Config {
            self.prune(&mut node, &cursor.schema_path);
        }
        self.splice(&mut node, &cursor.schema_path, cursor.row_id, partition)?;

        if cursor.schema_path == path::ROOT {
            Ok(node)
        } else if cursor.is_entry() {
            Ok(wrap(name, Value::Array(vec![node])))
        } else {
            Ok(wrap(name, node))
        }
    }

    /// Rows of `table` owned by `parent_id`, each with its own children spliced in.
    fn collect_rows(&self, table: &TableInfo, parent_id: i64, partition: Partition) -> Result<Vec<Value>> {
        if !table.is_config() {
            return self.storage.operational_rows(table, parent_id);
        }

        let mut entries = Vec::new();
        for row in self.storage.rows_for_parent(table, parent_id)? {
            let mut document = row.document;
            if partition == Partition::Config {
                self.prune(&mut document, &table.schema_path);
            }
            self.splice(&mut document, &table.schema_path, row.id, partition)?;
            entries.push(document);
        }
        Ok(entries)
    }

    /// Insert the rows of every table directly below `schema_path` into `node`.
    fn splice(&self, node: &mut Value, schema_path: &str, row_id: i64, partition: Partition) -> Result<()> {
        if !node.is_object() {
            return Ok(());
        }

        for table in self.registry.direct_subtables(schema_path) {
            if partition == Partition::Config && !table.is_config() {
                continue;
            }
            let rows = self.collect_rows(table, row_id, partition)?;
            if rows.is_empty() {
                continue;
            }

            let relative = path::relative_segments(schema_path, &table.schema_path);
            let Some((list, containers)) = relative.split_last() else {
                continue;
            };
            if let Some(holder) = object_at(node, containers) {
                holder.insert(list.to_string(), Value::Array(rows));
            }
        }
        Ok(())
    }

    /// Drop config-false members at every depth.
    fn prune(&self, node: &mut Value, schema_path: &str) {
        let Value::Object(members) = node else {
            return;
        };
        members.retain(|name, _| !self.registry.is_config_false(&path::join(schema_path, name)));
        for (name, child) in members.iter_mut() {
            let child_path = path::join(schema_path, name);
            if self
                .registry
                .node(&child_path)
                .is_some_and(|n| n.kind == NodeKind::Container)
            {
                self.prune(child, &child_path);
            }
        }
    }
}

/// Walk down `containers` from `node`, creating empty containers as needed.
fn object_at<'v>(node: &'v mut Value, containers: &[&str]) -> Option<&'v mut Map<String, Value>> {
    let mut current = node;
    for name in containers {
        current = current
            .as_object_mut()?
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current.as_object_mut()
}
