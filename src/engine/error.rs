use ulid::Ulid;

/// What a conflicting holder of a slot is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderKind {
    Reservation,
    LineItem,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input, rejected before touching shared state.
    #[error("invalid request: {0}")]
    Validation(String),
    /// The slot is taken.
    #[error("slot unavailable: conflicts with {kind:?} {holder}")]
    Conflict { holder: Ulid, kind: HolderKind },
    #[error("not authorized: {0}")]
    Unauthorized(&'static str),
    /// Operation not valid in the row's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Payment evidence could not be persisted; nothing was committed.
    #[error("storage failed: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("check-in denied: {0}")]
    CheckInDenied(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    /// SQLSTATE used on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::Conflict { .. } => "23P01",
            EngineError::Unauthorized(_) => "42501",
            EngineError::InvalidState(_) | EngineError::CheckInDenied(_) => "55000",
            EngineError::Storage(_) | EngineError::WalError(_) => "58030",
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::LimitExceeded(_) => "54000",
        }
    }
}
