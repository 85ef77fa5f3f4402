use crate::error::{DalError, Result};
use crate::path;
use crate::schema::{NodeInfo, NodeKind, SchemaIndex, TableInfo};

/// Read-only lookups over a [`SchemaIndex`].
#[derive(Debug, Clone)]
pub struct TableRegistry {
    index: SchemaIndex,
}

impl TableRegistry {
    pub fn new(index: SchemaIndex) -> Self {
        TableRegistry { index }
    }

    pub fn index(&self) -> &SchemaIndex {
        &self.index
    }

    pub fn namespace(&self) -> &str {
        &self.index.namespace
    }

    pub fn root(&self) -> &TableInfo {
        &self.index.tables[path::ROOT]
    }

    /// Table owning `schema_path`: the longest table path it lies within.
    pub fn table_for(&self, schema_path: &str) -> &TableInfo {
        self.index
            .tables
            .values()
            .filter(|t| path::is_within(schema_path, &t.schema_path))
            .max_by_key(|t| t.schema_path.len())
            .unwrap_or_else(|| self.root())
    }

    /// Table whose rows *are* the entries at `schema_path`, if it is a list.
    pub fn list_table(&self, schema_path: &str) -> Option<&TableInfo> {
        self.index.tables.get(schema_path).filter(|t| t.parent.is_some())
    }

    pub fn table(&self, schema_path: &str) -> Result<&TableInfo> {
        self.index
            .tables
            .get(schema_path)
            .ok_or_else(|| DalError::InvalidTarget(format!("{schema_path} is not a list")))
    }

    /// Declared key field of the list table at `schema_path`.
    pub fn key_field(&self, schema_path: &str) -> Option<&str> {
        self.index.tables.get(schema_path).and_then(|t| t.key_field())
    }

    pub fn node(&self, schema_path: &str) -> Option<&NodeInfo> {
        self.index.nodes.get(schema_path)
    }

    pub fn kind(&self, schema_path: &str) -> Result<NodeKind> {
        self.node(schema_path)
            .map(|n| n.kind)
            .ok_or_else(|| DalError::InvalidTarget(format!("Unknown schema node {schema_path}")))
    }

    pub fn is_config_false(&self, schema_path: &str) -> bool {
        self.index
            .config_false_prefixes
            .iter()
            .any(|p| path::is_within(schema_path, p))
    }

    /// Tables below `schema_path` with no other table in between, in path order.
    pub fn direct_subtables(&self, schema_path: &str) -> Vec<&TableInfo> {
        self.index
            .tables
            .values()
            .filter(|t| t.schema_path != schema_path && path::is_within(&t.schema_path, schema_path))
            .filter(|t| match &t.parent {
                Some(parent) => {
                    parent == schema_path || !path::is_within(parent, schema_path)
                }
                None => false,
            })
            .collect()
    }

    /// Config list tables that are immediate children of the node at `schema_path`.
    pub fn child_list_tables(&self, schema_path: &str) -> Vec<&TableInfo> {
        match self.node(schema_path) {
            Some(node) => node
                .children
                .iter()
                .filter_map(|name| self.list_table(&path::join(schema_path, name)))
                .filter(|t| t.is_config())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Member name as stored in documents for `member` below `parent_schema`.
    ///
    /// Top-level members keep their module prefix; nested ones may arrive
    /// qualified in request bodies and are reduced to their local name.
    pub fn member_name<'m>(&self, parent_schema: &str, member: &'m str) -> Option<&'m str> {
        let node = self.node(parent_schema)?;
        if node.children.iter().any(|c| c == member) {
            return Some(member);
        }
        let local = path::local_name(member);
        if parent_schema != path::ROOT && node.children.iter().any(|c| c == local) {
            return Some(local);
        }
        None
    }
}
