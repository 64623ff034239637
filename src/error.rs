use thiserror::Error;

/// Error taxonomy for the query engine.
///
/// `Config` covers missing term/kind metadata and missing cohort mappings,
/// `CallerInput` covers semantic precondition failures (wrong break count,
/// malformed filter leaves) raised before any statement executes, `Store`
/// wraps errors from the underlying relational store, and `Cancelled` is
/// reported when a request is aborted between term queries.
#[derive(Error, Debug)]
pub enum PhenoqueryError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Caller input error: {0}")]
    CallerInput(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, PhenoqueryError>;

// Helper conversions
impl From<rusqlite::Error> for PhenoqueryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}
