pub mod callbacks;
pub mod config;
mod crud;
pub mod dal;
pub mod error;
pub mod migration;
pub mod path;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod storage;

pub use callbacks::{CallbackRegistry, NodeEvent};
pub use config::DalConfig;
pub use crud::PutOutcome;
pub use dal::Dal;
pub use error::{DalError, Result};
pub use resolver::Partition;
pub use schema::SchemaIndex;
