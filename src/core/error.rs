use thiserror::Error;

/// One unreadable field or collection element inside an otherwise readable snapshot.
///
/// These never abort a decode: the offending element is dropped and the error
/// is reported next to the decoded record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field '{field}' entry {index}: {reason}")]
pub struct FieldDecodeError {
    pub field: &'static str,
    pub index: usize,
    pub reason: String,
}

impl FieldDecodeError {
    pub fn new(field: &'static str, index: usize, reason: impl Into<String>) -> Self {
        Self {
            field,
            index,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Field decode error: {0}")]
    FieldDecode(#[from] FieldDecodeError),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Write error for '{0}': {1}")]
    WriteError(String, String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

impl<T> From<std::sync::PoisonError<T>> for StateError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
