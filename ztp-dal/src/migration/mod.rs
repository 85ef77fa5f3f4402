use crate::schema::SchemaIndex;
use std::collections::BTreeSet;

/// A single difference between the stored schema index and the one built
/// from the current schema file.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    NamespaceChanged { old: String, new: String },
    TableAdded { schema_path: String },
    TableRemoved { schema_path: String },
    /// SQL name, parent, key, uniqueness or columns differ
    TableChanged { schema_path: String },
    NodeAdded { schema_path: String },
    NodeRemoved { schema_path: String },
    /// Kind or config flag differ
    NodeChanged { schema_path: String },
}

impl SchemaChange {
    /// Whether the change can be applied to an existing database on open.
    /// Only additions are: new tables are created, new nodes start absent.
    pub fn is_safe(&self) -> bool {
        matches!(
            self,
            SchemaChange::TableAdded { .. } | SchemaChange::NodeAdded { .. }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            SchemaChange::NamespaceChanged { old, new } => {
                format!("Namespace changed: '{old}' -> '{new}'")
            }
            SchemaChange::TableAdded { schema_path } => {
                format!("Table for '{schema_path}' added")
            }
            SchemaChange::TableRemoved { schema_path } => {
                format!("Table for '{schema_path}' removed (rows would be orphaned)")
            }
            SchemaChange::TableChanged { schema_path } => {
                format!("Table for '{schema_path}' changed layout")
            }
            SchemaChange::NodeAdded { schema_path } => {
                format!("Node '{schema_path}' added")
            }
            SchemaChange::NodeRemoved { schema_path } => {
                format!("Node '{schema_path}' removed")
            }
            SchemaChange::NodeChanged { schema_path } => {
                format!("Node '{schema_path}' changed kind or config")
            }
        }
    }
}

/// Compare two schema indexes.
pub fn diff_indexes(old: &SchemaIndex, new: &SchemaIndex) -> Vec<SchemaChange> {
    let mut changes = Vec::new();

    if old.namespace != new.namespace {
        changes.push(SchemaChange::NamespaceChanged {
            old: old.namespace.clone(),
            new: new.namespace.clone(),
        });
    }

    let old_tables: BTreeSet<&String> = old.tables.keys().collect();
    let new_tables: BTreeSet<&String> = new.tables.keys().collect();
    for path in new_tables.difference(&old_tables) {
        changes.push(SchemaChange::TableAdded {
            schema_path: (*path).clone(),
        });
    }
    for path in old_tables.difference(&new_tables) {
        changes.push(SchemaChange::TableRemoved {
            schema_path: (*path).clone(),
        });
    }
    for path in old_tables.intersection(&new_tables) {
        if old.tables[*path] != new.tables[*path] {
            changes.push(SchemaChange::TableChanged {
                schema_path: (*path).clone(),
            });
        }
    }

    let old_nodes: BTreeSet<&String> = old.nodes.keys().collect();
    let new_nodes: BTreeSet<&String> = new.nodes.keys().collect();
    for path in new_nodes.difference(&old_nodes) {
        changes.push(SchemaChange::NodeAdded {
            schema_path: (*path).clone(),
        });
    }
    for path in old_nodes.difference(&new_nodes) {
        changes.push(SchemaChange::NodeRemoved {
            schema_path: (*path).clone(),
        });
    }
    for path in old_nodes.intersection(&new_nodes) {
        let (before, after) = (&old.nodes[*path], &new.nodes[*path]);
        if before.kind != after.kind || before.config != after.config {
            changes.push(SchemaChange::NodeChanged {
                schema_path: (*path).clone(),
            });
        }
    }

    changes
}

/// The changes that prevent the database from being opened.
pub fn unsafe_changes(changes: &[SchemaChange]) -> Vec<&SchemaChange> {
    changes.iter().filter(|c| !c.is_safe()).collect()
}
