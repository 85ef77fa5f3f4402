// Data path resolution.
//
// A data path is walked segment by segment. Inside one table the walk only
// extends a pointer into the row's document; a `name=key` segment on a config
// list switches to that list's table and looks the row up by key.

use crate::error::{DalError, Result};
use crate::path::{self, Segment};
use crate::registry::TableRegistry;
use crate::schema::NodeKind;
use crate::storage::Storage;
use serde_json::Value;

/// Which half of the schema a request may address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Config-true nodes only
    Config,
    /// Config and operational nodes
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The root, a list entry, or a container or leaf inside a document
    Node,
    /// A list addressed without a key. Only scope resolution yields it; the
    /// cursor sits on the row owning the list.
    List,
}

/// A resolved position in the datastore.
#[derive(Debug, Clone)]
pub struct Cursor {
    /// Normalized data path of the target
    pub data_path: String,
    pub schema_path: String,
    pub target: Target,
    /// Schema path of the table holding `row_id`
    pub table: String,
    pub row_id: i64,
    /// Data path of the table-root row (`/` for the global root)
    pub root_path: String,
    /// Document of the table-root row
    pub document: Value,
    /// Member names leading from `document` to the target. For a list
    /// target, to the node holding the list.
    pub pointer: Vec<String>,
}

impl Cursor {
    pub fn node(&self) -> Option<&Value> {
        at(&self.document, &self.pointer)
    }

    pub fn node_mut(&mut self) -> Option<&mut Value> {
        at_mut(&mut self.document, &self.pointer)
    }

    /// True when the cursor addresses a list entry as a whole.
    pub fn is_entry(&self) -> bool {
        self.target == Target::Node && self.pointer.is_empty() && self.schema_path != path::ROOT
    }

    /// Key of the addressed list entry.
    pub fn entry_key(&self) -> Option<&str> {
        if !self.is_entry() {
            return None;
        }
        path::split_last(&self.data_path).and_then(|(_, last)| Segment::parse(last).key)
    }
}

pub fn at<'v>(document: &'v Value, pointer: &[String]) -> Option<&'v Value> {
    pointer.iter().try_fold(document, |node, name| node.get(name))
}

pub fn at_mut<'v>(document: &'v mut Value, pointer: &[String]) -> Option<&'v mut Value> {
    pointer.iter().try_fold(document, |node, name| node.get_mut(name))
}

pub struct PathResolver<'a> {
    registry: &'a TableRegistry,
    storage: &'a Storage,
    global_root: i64,
}

impl<'a> PathResolver<'a> {
    pub fn new(registry: &'a TableRegistry, storage: &'a Storage, global_root: i64) -> Self {
        PathResolver {
            registry,
            storage,
            global_root,
        }
    }

    /// Resolve `data_path`. `Ok(None)` means some part of it does not exist.
    /// A list named without a key is not a node and resolves to `None`.
    pub fn resolve(&self, data_path: &str, partition: Partition) -> Result<Option<Cursor>> {
        self.walk(data_path, partition, true)
    }

    /// Resolve the rows along `data_path` without requiring the final
    /// in-document members to exist yet.
    pub fn resolve_scope(&self, data_path: &str, partition: Partition) -> Result<Option<Cursor>> {
        self.walk(data_path, partition, false)
    }

    fn walk(&self, data_path: &str, partition: Partition, check_members: bool) -> Result<Option<Cursor>> {
        let mut schema_path = path::ROOT.to_string();
        let mut normalized = path::ROOT.to_string();
        let mut table = path::ROOT.to_string();
        let mut row_id = self.global_root;
        let mut root_path = path::ROOT.to_string();
        let mut pointer = Vec::new();
        let mut target = Target::Node;

        for segment in path::segments(data_path)? {
            if target == Target::List {
                return Err(DalError::InvalidTarget(format!(
                    "{data_path} continues below a list without a key"
                )));
            }

            let name = self
                .registry
                .member_name(&schema_path, segment.name)
                .ok_or_else(|| {
                    DalError::InvalidTarget(format!(
                        "'{}' is not a schema node below {schema_path}",
                        segment.name
                    ))
                })?
                .to_string();
            schema_path = path::join(&schema_path, &name);

            if partition == Partition::Config && self.registry.is_config_false(&schema_path) {
                return Err(DalError::InvalidTarget(format!(
                    "{data_path} addresses config false data"
                )));
            }

            if self.registry.kind(&schema_path)? != NodeKind::List {
                if segment.key.is_some() {
                    return Err(DalError::InvalidTarget(format!(
                        "{schema_path} is not a list and takes no key"
                    )));
                }
                normalized = path::join(&normalized, &name);
                pointer.push(name);
                continue;
            }

            let list = self.registry.table(&schema_path)?;
            match segment.key {
                None => {
                    normalized = path::join(&normalized, &name);
                    target = Target::List;
                }
                Some(_) if !list.is_config() => {
                    return Err(DalError::InvalidTarget(format!(
                        "Entries of {schema_path} have no key and cannot be addressed"
                    )));
                }
                Some(key) => {
                    let Some(id) = self.storage.find_row(list, row_id, key)? else {
                        return Ok(None);
                    };
                    normalized = path::join(&normalized, &format!("{name}={key}"));
                    table = schema_path.clone();
                    row_id = id;
                    root_path = normalized.clone();
                    pointer.clear();
                }
            }
        }

        if check_members && target == Target::List {
            return Ok(None);
        }
        let document = self.storage.load_document(self.registry.table(&table)?, row_id)?;
        if check_members && at(&document, &pointer).is_none() {
            return Ok(None);
        }

        Ok(Some(Cursor {
            data_path: normalized,
            schema_path,
            target,
            table,
            row_id,
            root_path,
            document,
            pointer,
        }))
    }
}
