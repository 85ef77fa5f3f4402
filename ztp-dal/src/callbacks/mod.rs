use crate::error::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Where a create or change notification happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEvent<'a> {
    /// Data path of the node, e.g. `/ztp:devices/device=A/settings`
    pub data_path: &'a str,
    pub schema_path: &'a str,
    /// Data path of the table-root row whose document is handed to the handler
    pub root_path: &'a str,
}

/// Create and change handlers receive the table-root document and may
/// modify it before it is written back.
pub type NodeHandler<C> = Box<dyn Fn(&NodeEvent<'_>, &mut Value, &mut C) -> Result<()> + Send + Sync>;

/// Delete handlers receive the data path of the removed node.
pub type DeleteHandler<C> = Box<dyn Fn(&str, &mut C) -> Result<()> + Send + Sync>;

/// Hooks keyed by schema path. Handlers registered for the same path run in
/// registration order; the first error aborts the request.
///
/// `C` is the caller's opaque context, passed mutably to every handler.
pub struct CallbackRegistry<C = ()> {
    create: HashMap<String, Vec<NodeHandler<C>>>,
    change: HashMap<String, Vec<NodeHandler<C>>>,
    delete: HashMap<String, Vec<DeleteHandler<C>>>,
}

impl<C> Default for CallbackRegistry<C> {
    fn default() -> Self {
        CallbackRegistry {
            create: HashMap::new(),
            change: HashMap::new(),
            delete: HashMap::new(),
        }
    }
}

impl<C> CallbackRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_create<F>(&mut self, schema_path: impl Into<String>, handler: F)
    where
        F: Fn(&NodeEvent<'_>, &mut Value, &mut C) -> Result<()> + Send + Sync + 'static,
    {
        self.create
            .entry(schema_path.into())
            .or_default()
            .push(Box::new(handler));
    }

    pub fn register_change<F>(&mut self, schema_path: impl Into<String>, handler: F)
    where
        F: Fn(&NodeEvent<'_>, &mut Value, &mut C) -> Result<()> + Send + Sync + 'static,
    {
        self.change
            .entry(schema_path.into())
            .or_default()
            .push(Box::new(handler));
    }

    pub fn register_delete<F>(&mut self, schema_path: impl Into<String>, handler: F)
    where
        F: Fn(&str, &mut C) -> Result<()> + Send + Sync + 'static,
    {
        self.delete
            .entry(schema_path.into())
            .or_default()
            .push(Box::new(handler));
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.change.is_empty() && self.delete.is_empty()
    }
}

/// Per-request dispatcher. Change handlers for a given data path fire at
/// most once per request.
pub(crate) struct Notifier<'r, C> {
    registry: &'r CallbackRegistry<C>,
    opaque: &'r mut C,
    changed: HashSet<String>,
}

impl<'r, C> Notifier<'r, C> {
    pub(crate) fn new(registry: &'r CallbackRegistry<C>, opaque: &'r mut C) -> Self {
        Notifier {
            registry,
            opaque,
            changed: HashSet::new(),
        }
    }

    pub(crate) fn created(&mut self, event: &NodeEvent<'_>, document: &mut Value) -> Result<()> {
        if let Some(handlers) = self.registry.create.get(event.schema_path) {
            log::debug!("Create callbacks for {}", event.data_path);
            for handler in handlers {
                handler(event, document, &mut *self.opaque)?;
            }
        }
        Ok(())
    }

    pub(crate) fn changed(&mut self, event: &NodeEvent<'_>, document: &mut Value) -> Result<()> {
        let Some(handlers) = self.registry.change.get(event.schema_path) else {
            return Ok(());
        };
        if !self.changed.insert(event.data_path.to_string()) {
            return Ok(());
        }
        log::debug!("Change callbacks for {}", event.data_path);
        for handler in handlers {
            handler(event, document, &mut *self.opaque)?;
        }
        Ok(())
    }

    pub(crate) fn deleted(&mut self, schema_path: &str, data_path: &str) -> Result<()> {
        if let Some(handlers) = self.registry.delete.get(schema_path) {
            log::debug!("Delete callbacks for {}", data_path);
            for handler in handlers {
                handler(data_path, &mut *self.opaque)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DalError;
    use serde_json::json;

    fn event<'a>(data_path: &'a str, schema_path: &'a str) -> NodeEvent<'a> {
        NodeEvent {
            data_path,
            schema_path,
            root_path: "/",
        }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let mut registry: CallbackRegistry<Vec<&'static str>> = CallbackRegistry::new();
        registry.register_create("/ztp:preferences", |_, _, log| {
            log.push("first");
            Ok(())
        });
        registry.register_create("/ztp:preferences", |_, doc, log| {
            log.push("second");
            doc["stamped"] = json!(true);
            Ok(())
        });

        let mut log = Vec::new();
        let mut doc = json!({});
        let mut notifier = Notifier::new(&registry, &mut log);
        notifier
            .created(&event("/ztp:preferences", "/ztp:preferences"), &mut doc)
            .unwrap();

        assert_eq!(log, vec!["first", "second"]);
        assert_eq!(doc, json!({"stamped": true}));
    }

    #[test]
    fn test_change_fires_once_per_data_path() {
        let mut registry: CallbackRegistry<usize> = CallbackRegistry::new();
        registry.register_change("/ztp:devices/device", |_, _, count| {
            *count += 1;
            Ok(())
        });

        let mut count = 0;
        let mut doc = json!({});
        let mut notifier = Notifier::new(&registry, &mut count);
        let a = event("/ztp:devices/device=A", "/ztp:devices/device");
        let b = event("/ztp:devices/device=B", "/ztp:devices/device");
        notifier.changed(&a, &mut doc).unwrap();
        notifier.changed(&a, &mut doc).unwrap();
        notifier.changed(&b, &mut doc).unwrap();
        drop(notifier);

        assert_eq!(count, 2);
    }

    #[test]
    fn test_handler_error_stops_dispatch() {
        let mut registry: CallbackRegistry<usize> = CallbackRegistry::new();
        registry.register_delete("/ztp:devices/device", |path, _| {
            Err(DalError::callback(path, "refused"))
        });
        registry.register_delete("/ztp:devices/device", |_, count| {
            *count += 1;
            Ok(())
        });

        let mut count = 0;
        let mut notifier = Notifier::new(&registry, &mut count);
        let err = notifier
            .deleted("/ztp:devices/device", "/ztp:devices/device=A")
            .unwrap_err();
        drop(notifier);

        assert!(matches!(err, DalError::Callback { .. }));
        assert_eq!(count, 0);
    }

    #[test]
    fn test_unregistered_paths_are_ignored() {
        let registry: CallbackRegistry = CallbackRegistry::new();
        assert!(registry.is_empty());
        let mut unit = ();
        let mut notifier = Notifier::new(&registry, &mut unit);
        notifier.deleted("/ztp:x", "/ztp:x").unwrap();
    }
}
