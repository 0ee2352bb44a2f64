use ccrelay_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("request had no messages to translate")]
    EmptyConversation,
    #[error("tool {name} has an input schema that could not be sanitised: {reason}")]
    InvalidToolSchema { name: String, reason: String },
    #[error("upstream returned a malformed candidate: {0}")]
    MalformedCandidate(String),
}

impl TransformError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransformError::EmptyConversation => ErrorKind::BadRequest,
            TransformError::InvalidToolSchema { .. } => ErrorKind::BadRequest,
            TransformError::MalformedCandidate(_) => ErrorKind::Transient,
        }
    }
}
