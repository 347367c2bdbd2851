use serde::Serialize;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    /// `entity` names the missing record kind ("resource", "team", ...).
    NotFound { entity: &'static str, id: Ulid },
    /// A reference named in a team's bulk structure does not exist.
    MissingReference { entity: &'static str, id: Ulid },
    AlreadyExists(Ulid),
    Forbidden(&'static str),
    InvalidSpan { start: Ms, end: Ms },
    /// Overlaps the given live reservation.
    Conflict(Ulid),
    ResourceDisabled(Ulid),
    UnknownSession(Ulid),
    SlotFilled { session_id: Ulid, index: u32 },
    CapacityExceeded { session_id: Ulid, capacity: u32 },
    NotAMember(Ulid),
    MalformedBatch(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    /// HTTP-style status for the uniform error shape.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::NotFound { .. } => 404,
            EngineError::Forbidden(_) => 403,
            EngineError::AlreadyExists(_) => 409,
            EngineError::WalError(_) => 500,
            EngineError::MissingReference { .. }
            | EngineError::InvalidSpan { .. }
            | EngineError::Conflict(_)
            | EngineError::ResourceDisabled(_)
            | EngineError::UnknownSession(_)
            | EngineError::SlotFilled { .. }
            | EngineError::CapacityExceeded { .. }
            | EngineError::NotAMember(_)
            | EngineError::MalformedBatch(_)
            | EngineError::LimitExceeded(_) => 400,
        }
    }

    /// Error class name. Also used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self.status() {
            404 => "NotFound",
            403 => "Forbidden",
            409 => "Conflict",
            500 => "Storage",
            _ => "Validation",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            EngineError::MissingReference { entity, id } => {
                write!(f, "referenced {entity} does not exist: {id}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidSpan { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::Conflict(id) => {
                write!(f, "time slot already reserved by reservation {id}")
            }
            EngineError::ResourceDisabled(id) => write!(f, "resource {id} is not available"),
            EngineError::UnknownSession(id) => write!(f, "session {id} is not part of this team"),
            EngineError::SlotFilled { session_id, index } => {
                write!(f, "slot already filled: seat {index} of session {session_id}")
            }
            EngineError::CapacityExceeded {
                session_id,
                capacity,
            } => write!(
                f,
                "capacity exceeded: session {session_id} has {capacity} seats"
            ),
            EngineError::NotAMember(id) => write!(f, "user {id} is not a member of this team"),
            EngineError::MalformedBatch(msg) => write!(f, "malformed batch: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Uniform error body handed to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ErrorDetail {
    pub fn from_error(err: &EngineError, instance: Option<&str>) -> Self {
        let status = err.status();
        let title = match status {
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            409 => "Conflict",
            _ => "Internal Server Error",
        };
        Self {
            kind: err.kind().to_string(),
            title: title.to_string(),
            status,
            detail: err.to_string(),
            instance: instance.map(str::to_string),
        }
    }
}
