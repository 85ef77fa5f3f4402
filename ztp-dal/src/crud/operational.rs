use super::{entries, single_member, CrudEngine};
use crate::error::{DalError, Result};
use crate::path::{self, Segment};
use crate::resolver::{Cursor, Partition, Target};
use crate::schema::NodeKind;
use serde_json::{Map, Value};

impl<'a> CrudEngine<'a> {
    /// Append rows to the operational list named by the body's single member.
    /// Returns the number of rows written.
    pub(crate) fn post_operational(&self, parent_path: &str, body: Value) -> Result<usize> {
        let (member, value) = single_member(body)?;
        let mut scope = self
            .resolver()
            .resolve_scope(parent_path, Partition::Any)?
            .ok_or_else(|| DalError::ParentNodeNotFound(parent_path.to_string()))?;
        if scope.target == Target::List {
            return Err(DalError::InvalidTarget(format!(
                "{parent_path} is a list; address one of its entries"
            )));
        }

        let table = self
            .registry
            .member_name(&scope.schema_path, &member)
            .and_then(|name| self.registry.list_table(&path::join(&scope.schema_path, name)))
            .filter(|table| !table.is_config())
            .ok_or_else(|| {
                DalError::InvalidTarget(format!(
                    "'{member}' is not an operational list below {parent_path}"
                ))
            })?;

        self.materialize(&mut scope)?;

        let mut written = 0;
        for entry in entries(value)? {
            let Value::Object(fields) = entry else {
                return Err(DalError::MalformedBody(format!(
                    "Entries of {} must be objects",
                    table.schema_path
                )));
            };
            self.storage.insert_operational(table, scope.row_id, &fields)?;
            written += 1;
        }
        log::debug!("Appended {written} rows to {}", table.schema_path);
        Ok(written)
    }

    /// Set a config-false node held inside a row document.
    pub(crate) fn put_operational(&self, data_path: &str, body: Value) -> Result<()> {
        path::validate(data_path)?;
        let Some((parent_path, last)) = path::split_last(data_path) else {
            return Err(DalError::InvalidTarget("The root is config data".into()));
        };
        let segment = Segment::parse(last);
        let mut scope = self
            .resolver()
            .resolve_scope(parent_path, Partition::Any)?
            .ok_or_else(|| DalError::ParentNodeNotFound(parent_path.to_string()))?;

        let name = self
            .registry
            .member_name(&scope.schema_path, segment.name)
            .ok_or_else(|| DalError::InvalidTarget(format!("Unknown node {data_path}")))?
            .to_string();
        let schema_path = path::join(&scope.schema_path, &name);
        if scope.target == Target::List
            || segment.key.is_some()
            || !self.registry.is_config_false(&schema_path)
            || self.registry.list_table(&schema_path).is_some()
        {
            return Err(DalError::InvalidTarget(format!(
                "{data_path} is not an operational node held in a document"
            )));
        }

        let value = unwrap_member(&name, body);
        if self.registry.kind(&schema_path)? == NodeKind::Container && !value.is_object() {
            return Err(DalError::MalformedBody(format!(
                "{data_path} must be an object"
            )));
        }

        self.materialize(&mut scope)?;
        scope
            .node_mut()
            .and_then(Value::as_object_mut)
            .ok_or_else(|| DalError::InvalidTarget(format!("{parent_path} cannot hold children")))?
            .insert(name, value);
        self.persist(&scope)
    }

    /// Create the missing config-false containers along the cursor's pointer.
    /// A missing config node means the parent does not exist.
    fn materialize(&self, cursor: &mut Cursor) -> Result<()> {
        let mut schema_path = cursor.table.clone();
        let mut created = false;
        let mut node = &mut cursor.document;

        for name in &cursor.pointer {
            schema_path = path::join(&schema_path, name);
            let members = node.as_object_mut().ok_or_else(|| {
                DalError::InvalidTarget(format!("{} cannot hold children", cursor.data_path))
            })?;
            if !members.contains_key(name) {
                if !self.registry.is_config_false(&schema_path) {
                    return Err(DalError::ParentNodeNotFound(cursor.data_path.clone()));
                }
                created = true;
            }
            node = members
                .entry(name.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        if created {
            self.persist(cursor)?;
        }
        Ok(())
    }
}

/// Accept both `{ "<name>": value }` and a bare value.
fn unwrap_member(name: &str, body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.len() == 1 => {
            let wrapped = map
                .keys()
                .next()
                .filter(|k| path::local_name(k) == path::local_name(name))
                .cloned();
            match wrapped {
                Some(key) => map.remove(&key).unwrap_or(Value::Null),
                None => Value::Object(map),
            }
        }
        other => other,
    }
}
