use super::types::{LeafType, NodeDefinition, NodeKindDefinition, SchemaDefinition};
use crate::error::{DalError, Result};
use crate::path;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// SQL name of the table holding the global root and the well-known rows.
pub const SINGLETONS_TABLE: &str = "singletons";

/// Columns every list table carries; schema names may not reuse them.
pub const RESERVED_COLUMNS: &[&str] = &["row_id", "parent_id", "document"];

/// How the CRUD engine treats a node while walking documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Container,
    List,
    /// Leaves, leaf-lists and anydata: compared and replaced as whole values.
    Leaf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub config: bool,
    /// Member names of child nodes, in schema order
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnKind {
    Text,
    Integer,
    Boolean,
    DateTime,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TableKind {
    /// The singletons table; its `global-root` row holds the root document.
    Root,
    /// One row per entry of a config list, document column holds the entry.
    Config { key: String, globally_unique: bool },
    /// One row per entry of a config-false list, one typed column per leaf.
    Operational { columns: Vec<ColumnDef> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema_path: String,
    /// SQL table name
    pub name: String,
    /// Schema path of the owning table, `None` for the root table
    pub parent: Option<String>,
    pub kind: TableKind,
}

impl TableInfo {
    pub fn is_config(&self) -> bool {
        !matches!(self.kind, TableKind::Operational { .. })
    }

    pub fn key_field(&self) -> Option<&str> {
        match &self.kind {
            TableKind::Config { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Build-time view of the schema: which schema paths map to which tables,
/// which subtrees are config-false, and what kind every node is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaIndex {
    pub namespace: String,
    pub nodes: BTreeMap<String, NodeInfo>,
    pub tables: BTreeMap<String, TableInfo>,
    pub config_false_prefixes: BTreeSet<String>,
}

impl SchemaIndex {
    /// Walk the schema depth-first and index every node.
    pub fn build(schema: &SchemaDefinition) -> Result<Self> {
        let mut builder = Builder {
            index: SchemaIndex {
                namespace: schema.namespace.clone(),
                nodes: BTreeMap::new(),
                tables: BTreeMap::new(),
                config_false_prefixes: BTreeSet::new(),
            },
            table_names: HashSet::from([SINGLETONS_TABLE.to_string()]),
        };

        builder.index.tables.insert(
            path::ROOT.to_string(),
            TableInfo {
                schema_path: path::ROOT.to_string(),
                name: SINGLETONS_TABLE.to_string(),
                parent: None,
                kind: TableKind::Root,
            },
        );
        builder.index.nodes.insert(
            path::ROOT.to_string(),
            NodeInfo {
                kind: NodeKind::Container,
                config: true,
                children: schema.nodes.iter().map(|n| n.name.clone()).collect(),
            },
        );

        let prefix = format!("{}:", schema.namespace);
        check_unique_children(path::ROOT, &schema.nodes)?;
        for node in &schema.nodes {
            if !node.name.starts_with(&prefix) {
                return Err(DalError::Schema(format!(
                    "Top-level node '{}' must be qualified with '{}'",
                    node.name, prefix
                )));
            }
            builder.walk(node, path::ROOT, path::ROOT, true)?;
        }

        Ok(builder.index)
    }

    /// Keep the SQL names a database built from `stored` already uses.
    /// Tables new to this index are renamed away from every stored name, so
    /// inserting a list never renames one that exists on disk.
    pub fn adopt_table_names(&mut self, stored: &SchemaIndex) {
        let mut used: HashSet<String> = stored.tables.values().map(|t| t.name.clone()).collect();
        used.insert(SINGLETONS_TABLE.to_string());

        let mut added = Vec::new();
        for (schema_path, table) in self.tables.iter_mut() {
            match stored.tables.get(schema_path) {
                Some(existing) => table.name = existing.name.clone(),
                None => added.push(table),
            }
        }
        for table in added {
            while used.contains(&table.name) {
                table.name.push('2');
            }
            used.insert(table.name.clone());
        }
    }

    /// Member name a GET response uses for the node at `schema_path`.
    pub fn qualified_name(&self, schema_path: &str) -> String {
        let last = schema_path.rsplit('/').next().unwrap_or_default();
        if last.contains(':') {
            last.to_string()
        } else {
            format!("{}:{}", self.namespace, last)
        }
    }
}

struct Builder {
    index: SchemaIndex,
    table_names: HashSet<String>,
}

impl Builder {
    fn walk(
        &mut self,
        node: &NodeDefinition,
        parent_path: &str,
        parent_table: &str,
        parent_config: bool,
    ) -> Result<()> {
        let schema_path = path::join(parent_path, &node.name);

        if node.name.is_empty() || node.name.contains('/') || node.name.contains('=') {
            return Err(DalError::Schema(format!(
                "Invalid node name '{}' under {parent_path}",
                node.name
            )));
        }

        let config = match node.config {
            Some(true) if !parent_config => {
                return Err(DalError::Schema(format!(
                    "{schema_path} is config true below a config false node"
                )));
            }
            Some(c) => c,
            None => parent_config,
        };
        if !config
            && !self
                .index
                .config_false_prefixes
                .iter()
                .any(|p| path::is_within(&schema_path, p))
        {
            self.index.config_false_prefixes.insert(schema_path.clone());
        }

        let kind = match node.kind {
            NodeKindDefinition::Container => NodeKind::Container,
            NodeKindDefinition::List => NodeKind::List,
            NodeKindDefinition::Leaf
            | NodeKindDefinition::LeafList
            | NodeKindDefinition::Anydata => NodeKind::Leaf,
        };

        // Operational lists are flattened into columns; nothing below them is indexed.
        let descend = kind != NodeKind::Leaf && !(kind == NodeKind::List && !config);
        self.index.nodes.insert(
            schema_path.clone(),
            NodeInfo {
                kind,
                config,
                children: if descend {
                    node.children.iter().map(|c| c.name.clone()).collect()
                } else {
                    Vec::new()
                },
            },
        );

        let mut table_for_children = parent_table.to_string();
        if kind == NodeKind::List {
            let table_kind = if config {
                config_table_kind(node, &schema_path)?
            } else {
                operational_table_kind(node, &schema_path)?
            };
            let name = self.table_name(&schema_path);
            self.index.tables.insert(
                schema_path.clone(),
                TableInfo {
                    schema_path: schema_path.clone(),
                    name,
                    parent: Some(parent_table.to_string()),
                    kind: table_kind,
                },
            );
            table_for_children = schema_path.clone();
        }

        if descend {
            check_unique_children(&schema_path, &node.children)?;
            for child in &node.children {
                self.walk(child, &schema_path, &table_for_children, config)?;
            }
        }
        Ok(())
    }

    /// Table names are the initials of the path's local names, made unique.
    fn table_name(&mut self, schema_path: &str) -> String {
        let mut name: String = path::relative_segments(path::ROOT, schema_path)
            .iter()
            .filter_map(|seg| path::local_name(seg).chars().next())
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if name.is_empty() {
            name.push('t');
        }
        while self.table_names.contains(&name) {
            name.push('2');
        }
        self.table_names.insert(name.clone());
        name
    }
}

fn check_unique_children(parent: &str, children: &[NodeDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for child in children {
        if !seen.insert(child.name.as_str()) {
            return Err(DalError::Schema(format!(
                "Duplicate node '{}' under {parent}",
                child.name
            )));
        }
    }
    Ok(())
}

fn config_table_kind(node: &NodeDefinition, schema_path: &str) -> Result<TableKind> {
    let key = node.key.as_deref().ok_or_else(|| {
        DalError::Schema(format!("Config list {schema_path} has no key"))
    })?;
    if key.contains(' ') {
        return Err(DalError::Schema(format!(
            "Config list {schema_path} declares more than one key"
        )));
    }
    if RESERVED_COLUMNS.contains(&key) {
        return Err(DalError::Schema(format!(
            "Key '{key}' of {schema_path} collides with a reserved column"
        )));
    }
    match node.child(key) {
        Some(leaf) if leaf.kind == NodeKindDefinition::Leaf => {}
        _ => {
            return Err(DalError::Schema(format!(
                "Key '{key}' of {schema_path} is not a child leaf"
            )));
        }
    }
    Ok(TableKind::Config {
        key: key.to_string(),
        globally_unique: node.globally_unique,
    })
}

fn operational_table_kind(node: &NodeDefinition, schema_path: &str) -> Result<TableKind> {
    let mut columns = Vec::with_capacity(node.children.len());
    for child in &node.children {
        if RESERVED_COLUMNS.contains(&child.name.as_str()) {
            return Err(DalError::Schema(format!(
                "Leaf '{}' of {schema_path} collides with a reserved column",
                child.name
            )));
        }
        if has_list(child) {
            return Err(DalError::Schema(format!(
                "Operational list {schema_path} cannot hold the list in '{}'",
                child.name
            )));
        }
        let kind = match (child.kind, child.leaf_type) {
            (NodeKindDefinition::Leaf, LeafType::String) => ColumnKind::Text,
            (NodeKindDefinition::Leaf, LeafType::Integer) => ColumnKind::Integer,
            (NodeKindDefinition::Leaf, LeafType::Boolean) => ColumnKind::Boolean,
            (NodeKindDefinition::Leaf, LeafType::DateAndTime) => ColumnKind::DateTime,
            _ => ColumnKind::Json,
        };
        columns.push(ColumnDef {
            name: child.name.clone(),
            kind,
        });
    }
    Ok(TableKind::Operational { columns })
}

fn has_list(node: &NodeDefinition) -> bool {
    node.kind == NodeKindDefinition::List || node.children.iter().any(has_list)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::parse_schema_str;

    pub(crate) const TEST_SCHEMA: &str = r#"
namespace: ztp
nodes:
  - name: "ztp:devices"
    kind: container
    children:
      - name: device
        kind: list
        key: serial-number
        globally_unique: true
        children:
          - { name: serial-number, kind: leaf }
          - { name: ip, kind: leaf }
          - { name: tags, kind: leaf-list }
          - name: settings
            kind: container
            children:
              - { name: mode, kind: leaf }
              - name: rule
                kind: list
                key: id
                children:
                  - { name: id, kind: leaf, type: integer }
                  - { name: action, kind: leaf }
          - name: interface
            kind: list
            key: name
            children:
              - { name: name, kind: leaf }
              - { name: mtu, kind: leaf, type: integer }
          - name: lifecycle-statistics
            kind: container
            config: false
            children:
              - { name: nbi-access-stats, kind: anydata }
          - name: bootstrapping-log
            kind: container
            config: false
            children:
              - name: log-entry
                kind: list
                children:
                  - { name: timestamp, kind: leaf, type: date-and-time }
                  - { name: event-type, kind: leaf }
                  - { name: attempt, kind: leaf, type: integer }
                  - { name: final, kind: leaf, type: boolean }
                  - { name: details, kind: container }
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
            children:
              - { name: serial-number, kind: leaf }
  - name: "ztp:audit-log"
    kind: container
    config: false
    children:
      - name: log-entry
        kind: list
        children:
          - { name: timestamp, kind: leaf, type: date-and-time }
          - { name: method, kind: leaf }
  - name: "ztp:preferences"
    kind: container
    children:
      - { name: greeting, kind: leaf }
"#;

    pub(crate) fn test_index() -> SchemaIndex {
        SchemaIndex::build(&parse_schema_str(TEST_SCHEMA).unwrap()).unwrap()
    }

    #[test]
    fn test_tables_are_created_for_lists() {
        let index = test_index();
        let paths: Vec<&str> = index.tables.keys().map(|k| k.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/",
                "/ztp:audit-log/log-entry",
                "/ztp:devices/device",
                "/ztp:devices/device/bootstrapping-log/log-entry",
                "/ztp:devices/device/interface",
                "/ztp:devices/device/settings/rule",
                "/ztp:tenants/tenant",
                "/ztp:tenants/tenant/device",
            ]
        );

        let rule = &index.tables["/ztp:devices/device/settings/rule"];
        assert_eq!(rule.parent.as_deref(), Some("/ztp:devices/device"));
        assert_eq!(rule.key_field(), Some("id"));

        let device = &index.tables["/ztp:devices/device"];
        assert_eq!(
            device.kind,
            TableKind::Config {
                key: "serial-number".into(),
                globally_unique: true
            }
        );
        assert_eq!(device.parent.as_deref(), Some("/"));
    }

    #[test]
    fn test_table_names_are_unique() {
        let index = test_index();
        let mut names: Vec<&str> = index.tables.values().map(|t| t.name.as_str()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(index.tables["/ztp:devices/device"].name, "dd");
        assert_eq!(index.tables["/ztp:tenants/tenant/device"].name, "ttd");
        assert_eq!(index.tables["/"].name, SINGLETONS_TABLE);
    }

    #[test]
    fn test_config_false_prefixes_are_topmost_only() {
        let index = test_index();
        let prefixes: Vec<&str> = index
            .config_false_prefixes
            .iter()
            .map(|p| p.as_str())
            .collect();
        assert_eq!(
            prefixes,
            vec![
                "/ztp:audit-log",
                "/ztp:devices/device/bootstrapping-log",
                "/ztp:devices/device/lifecycle-statistics",
            ]
        );
    }

    #[test]
    fn test_operational_columns() {
        let index = test_index();
        let table = &index.tables["/ztp:devices/device/bootstrapping-log/log-entry"];
        assert!(!table.is_config());
        match &table.kind {
            TableKind::Operational { columns } => {
                let kinds: Vec<(&str, ColumnKind)> =
                    columns.iter().map(|c| (c.name.as_str(), c.kind)).collect();
                assert_eq!(
                    kinds,
                    vec![
                        ("timestamp", ColumnKind::DateTime),
                        ("event-type", ColumnKind::Text),
                        ("attempt", ColumnKind::Integer),
                        ("final", ColumnKind::Boolean),
                        ("details", ColumnKind::Json),
                    ]
                );
            }
            other => panic!("unexpected table kind {other:?}"),
        }
    }

    #[test]
    fn test_node_kinds() {
        let index = test_index();
        assert_eq!(index.nodes["/ztp:devices"].kind, NodeKind::Container);
        assert_eq!(index.nodes["/ztp:devices/device"].kind, NodeKind::List);
        assert_eq!(index.nodes["/ztp:devices/device/tags"].kind, NodeKind::Leaf);
        assert!(!index.nodes["/ztp:devices/device/lifecycle-statistics"].config);
        assert_eq!(
            index.nodes["/"].children,
            vec!["ztp:devices", "ztp:tenants", "ztp:audit-log", "ztp:preferences"]
        );
    }

    #[test]
    fn test_qualified_name() {
        let index = test_index();
        assert_eq!(index.qualified_name("/ztp:devices"), "ztp:devices");
        assert_eq!(index.qualified_name("/ztp:devices/device"), "ztp:device");
    }

    #[test]
    fn test_config_list_without_key_is_rejected() {
        let schema = parse_schema_str(
            r#"
namespace: ztp
nodes:
  - name: "ztp:things"
    kind: list
    children:
      - { name: name, kind: leaf }
"#,
        )
        .unwrap();
        assert!(matches!(SchemaIndex::build(&schema), Err(DalError::Schema(_))));
    }

    #[test]
    fn test_config_true_below_config_false_is_rejected() {
        let schema = parse_schema_str(
            r#"
namespace: ztp
nodes:
  - name: "ztp:state"
    kind: container
    config: false
    children:
      - { name: knob, kind: leaf, config: true }
"#,
        )
        .unwrap();
        assert!(SchemaIndex::build(&schema).is_err());
    }

    #[test]
    fn test_unqualified_top_level_is_rejected() {
        let schema = parse_schema_str(
            r#"
namespace: ztp
nodes:
  - { name: devices, kind: container }
"#,
        )
        .unwrap();
        assert!(SchemaIndex::build(&schema).is_err());
    }

    #[test]
    fn test_reserved_key_is_rejected() {
        let schema = parse_schema_str(
            r#"
namespace: ztp
nodes:
  - name: "ztp:things"
    kind: list
    key: document
    children:
      - { name: document, kind: leaf }
"#,
        )
        .unwrap();
        assert!(SchemaIndex::build(&schema).is_err());
    }

    #[test]
    fn test_adopted_names_survive_an_inserted_list() {
        let before = r#"
namespace: ztp
nodes:
  - name: "ztp:x"
    kind: container
    children:
      - name: dev
        kind: list
        key: id
        children:
          - { name: id, kind: leaf }
"#;
        let after = before.replace(
            "      - name: dev\n",
            "      - name: data\n        kind: list\n        key: id\n        children:\n          - { name: id, kind: leaf }\n      - name: dev\n",
        );
        let stored = SchemaIndex::build(&parse_schema_str(before).unwrap()).unwrap();
        assert_eq!(stored.tables["/ztp:x/dev"].name, "xd");

        let mut index = SchemaIndex::build(&parse_schema_str(&after).unwrap()).unwrap();
        assert_eq!(index.tables["/ztp:x/dev"].name, "xd2");
        index.adopt_table_names(&stored);
        assert_eq!(index.tables["/ztp:x/dev"].name, "xd");
        assert_eq!(index.tables["/ztp:x/data"].name, "xd2");
        assert_eq!(index.tables["/"].name, SINGLETONS_TABLE);
    }

    #[test]
    fn test_list_below_operational_list_is_rejected() {
        for nested in [
            "          - { name: hop, kind: list, key: n, children: [{ name: n, kind: leaf }] }",
            "          - name: trace\n            kind: container\n            children:\n              - { name: hop, kind: list, key: n, children: [{ name: n, kind: leaf }] }",
        ] {
            let yaml = TEST_SCHEMA.replace(
                "          - { name: method, kind: leaf }",
                &format!("          - {{ name: method, kind: leaf }}\n{nested}"),
            );
            let schema = parse_schema_str(&yaml).unwrap();
            match SchemaIndex::build(&schema) {
                Err(DalError::Schema(message)) => {
                    assert!(message.contains("/ztp:audit-log/log-entry"), "{message}")
                }
                other => panic!("expected a schema error, got {other:?}"),
            }
        }
    }
}
