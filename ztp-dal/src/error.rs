use thiserror::Error;

#[derive(Error, Debug)]
pub enum DalError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Parent node not found: {0}")]
    ParentNodeNotFound(String),

    #[error("Node already exists: {0}")]
    NodeAlreadyExists(String),

    #[error("Too many nodes found for key '{key}' in table '{table}'")]
    TooManyNodesFound { table: String, key: String },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Callback for {path} failed: {message}")]
    Callback { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl DalError {
    /// The HTTP status a RESTCONF front end should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            DalError::NodeNotFound(_) | DalError::ParentNodeNotFound(_) => 404,
            DalError::NodeAlreadyExists(_) => 409,
            DalError::InvalidTarget(_) | DalError::MalformedBody(_) => 400,
            DalError::TooManyNodesFound { .. } => 501,
            _ => 500,
        }
    }

    /// Build a callback failure; handlers use this to abort the request.
    pub fn callback(path: impl Into<String>, message: impl Into<String>) -> Self {
        DalError::Callback {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DalError>;
