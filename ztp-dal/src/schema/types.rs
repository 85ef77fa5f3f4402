use serde::{Deserialize, Serialize};

/// Top-level schema definition parsed from schema.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Application namespace; top-level node names carry it as a `ns:` prefix.
    pub namespace: String,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

/// Definition of a single schema node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    pub kind: NodeKindDefinition,
    /// `None` inherits from the parent. The root is config-true.
    #[serde(default)]
    pub config: Option<bool>,
    /// Key leaf of a config list
    #[serde(default)]
    pub key: Option<String>,
    /// Key values are unique across all parents, not just per parent
    #[serde(default)]
    pub globally_unique: bool,
    #[serde(rename = "type", default)]
    pub leaf_type: LeafType,
    #[serde(default)]
    pub children: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKindDefinition {
    Container,
    List,
    Leaf,
    LeafList,
    Anydata,
}

/// Leaf value type. Only relevant where a leaf becomes a typed column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeafType {
    #[default]
    String,
    Integer,
    Boolean,
    DateAndTime,
}

impl NodeDefinition {
    pub fn child(&self, name: &str) -> Option<&NodeDefinition> {
        self.children.iter().find(|c| c.name == name)
    }
}
