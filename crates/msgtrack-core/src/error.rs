use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEventError {
    #[error("status event is missing a message id")]
    MissingMessageId,
    #[error("status event for {message_id} is missing a status")]
    MissingStatus { message_id: String },
    #[error("status event for {message_id} is missing a timestamp")]
    MissingTimestamp { message_id: String },
    #[error("status event for {message_id} has an unparseable timestamp: {raw}")]
    InvalidTimestamp { message_id: String, raw: String },
    #[error("status event for {message_id} carries no conversation id")]
    MissingConversation { message_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("event source unavailable: {0}")]
    Unavailable(String),
    #[error("event source rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("event source returned an invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store returned a corrupt record: {0}")]
    Corrupt(String),
    #[error("store rejected write: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event for {found} routed to reconciliation of {expected}")]
    ForeignEvent { expected: String, found: String },
    #[error("concurrent writers kept winning for {message_id}; deferring to next pass")]
    Contended { message_id: String },
}

impl ReconcileError {
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, ReconcileError::Store(err) if err.is_unavailable())
    }
}
