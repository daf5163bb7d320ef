use thiserror::Error;

/// The taxonomy of failures the core can produce, carried all the way to the HTTP and chat
/// boundaries. Modeled on the `DatetimeParseError` split between variants that should be shown
/// to the user verbatim and variants that shouldn't.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("event is {state}, cannot {action}")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },

    #[error("{user} is not authorized to {action}")]
    Unauthorized { user: String, action: &'static str },

    #[error("{0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("internal invariant violated: {0}")]
    Fatal(String),
}

impl CoreError {
    /// The stable, machine-readable kind string used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NotFound { .. } => "not_found",
            CoreError::InvalidState { .. } => "invalid_state",
            CoreError::Unauthorized { .. } => "unauthorized",
            CoreError::Conflict(_) => "conflict",
            CoreError::Transient(_) => "transient",
            CoreError::Fatal(_) => "fatal",
        }
    }

    /// Whether `self`'s Display text is safe to show directly to an end user, as opposed to
    /// internal detail that should only go to logs.
    pub fn user_facing(&self) -> bool {
        !matches!(self, CoreError::Transient(_) | CoreError::Fatal(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
