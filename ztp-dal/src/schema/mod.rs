mod index;
mod parser;
mod types;

pub use index::{
    ColumnDef, ColumnKind, NodeInfo, NodeKind, SchemaIndex, TableInfo, TableKind,
    RESERVED_COLUMNS, SINGLETONS_TABLE,
};
pub use parser::{parse_schema, parse_schema_str};
pub use types::{LeafType, NodeDefinition, NodeKindDefinition, SchemaDefinition};

#[cfg(test)]
pub(crate) use index::tests::{test_index, TEST_SCHEMA};
