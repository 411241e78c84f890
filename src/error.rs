//! Orchestrator error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Orchestrator error that can be serialized for API surfaces.
#[derive(Debug)]
pub struct OrchestratorError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input (empty id, self-dependency, port out of range)
    Validation,
    /// Instance or edge not registered
    NotFound,
    /// Edge insert would create a dependency cycle
    Cycle,
    /// Identical dependency edge already exists
    DuplicateEdge,
    /// Pre-start isolation gate failed
    IsolationViolation,
    /// OS refused to create the process
    Spawn,
    /// Process control error
    Process,
    /// Operation deadline expired
    Timeout,
    /// REQUIRES dependency did not become healthy in time
    DependencyNotHealthy,
    /// Backing store error
    Store,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Inconsistent internal state
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::Validation => 1001,
            Self::NotFound => 1002,
            Self::Cycle => 1003,
            Self::DuplicateEdge => 1004,
            Self::IsolationViolation => 2001,
            Self::Spawn => 3001,
            Self::Process => 3002,
            Self::Timeout => 3003,
            Self::DependencyNotHealthy => 3004,
            Self::Store => 4001,
            Self::Config => 4002,
            Self::Io => 4003,
            Self::Internal => 9999,
        }
    }
}

impl OrchestratorError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Validation, message)
    }

    pub fn not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn cycle(path: &[String]) -> Self {
        Self::new(
            ErrorKind::Cycle,
            HashMap::from([("path".to_string(), path.join(" -> "))]),
        )
    }

    pub fn duplicate_edge(from: &str, to: &str) -> Self {
        Self::new(
            ErrorKind::DuplicateEdge,
            HashMap::from([
                ("from".to_string(), from.to_string()),
                ("to".to_string(), to.to_string()),
            ]),
        )
    }

    pub fn isolation(instance_id: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::IsolationViolation,
            HashMap::from([
                ("id".to_string(), instance_id.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Spawn, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Timeout, what)
    }

    pub fn dependency_not_healthy(instance_id: &str, dependency_id: &str) -> Self {
        Self::new(
            ErrorKind::DependencyNotHealthy,
            HashMap::from([
                ("id".to_string(), instance_id.to_string()),
                ("dependency".to_string(), dependency_id.to_string()),
            ]),
        )
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Store, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Payload value for a key, if present.
    pub fn payload_get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl Serialize for OrchestratorError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("OrchestratorError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
