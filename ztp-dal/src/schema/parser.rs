use crate::error::Result;
use super::types::SchemaDefinition;
use std::path::Path;

/// Parse a schema.yaml file into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LeafType, NodeKindDefinition};

    #[test]
    fn test_parse_nested_nodes() {
        let schema = parse_schema_str(
            r#"
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
          - { name: port, kind: leaf, type: integer }
          - { name: stats, kind: container, config: false }
"#,
        )
        .unwrap();

        assert_eq!(schema.namespace, "ztp");
        let devices = &schema.nodes[0];
        assert_eq!(devices.kind, NodeKindDefinition::Container);
        let device = devices.child("device").unwrap();
        assert_eq!(device.kind, NodeKindDefinition::List);
        assert_eq!(device.key.as_deref(), Some("serial-number"));
        assert!(device.globally_unique);
        assert_eq!(device.child("port").unwrap().leaf_type, LeafType::Integer);
        assert_eq!(device.child("stats").unwrap().config, Some(false));
        assert_eq!(device.child("serial-number").unwrap().config, None);
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let result = parse_schema_str(
            r#"
namespace: ztp
nodes:
  - { name: "ztp:x", kind: choice }
"#,
        );
        assert!(result.is_err());
    }
}
