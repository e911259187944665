use std::result::Result as StdResult;

/// Error labels attached to failure responses so drivers know how to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLabel {
    TransientTransactionError,
    UnknownTransactionCommitResult,
}

impl ErrorLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorLabel::TransientTransactionError => "TransientTransactionError",
            ErrorLabel::UnknownTransactionCommitResult => "UnknownTransactionCommitResult",
        }
    }
}

/// Command-level failure taxonomy. Each variant knows its own numeric `code`
/// and `codeName`, mirroring the subset of MongoDB's error catalog this
/// server claims compatibility with.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CommandError {
    #[error("{0}")]
    BadValue(String),

    #[error("{0}")]
    TypeMismatch(String),

    #[error("Performing an update on the path '{0}' would modify the immutable field '_id'")]
    ImmutableField(String),

    #[error("Cannot create field '{0}' in element: path conflict")]
    PathConflict(String),

    #[error("E11000 duplicate key error: {0}")]
    DuplicateKey(String),

    #[error("Given transaction number does not match any in-progress transactions")]
    NoSuchTransaction,

    #[error("no such command: '{0}'")]
    CommandNotFound(String),

    #[error("ns not found: {0}")]
    NamespaceNotFound(String),

    #[error("{0}")]
    TransientInternal(String),
}

impl CommandError {
    pub fn code(&self) -> i32 {
        match self {
            CommandError::BadValue(_) => 2,
            CommandError::TypeMismatch(_) => 14,
            CommandError::ImmutableField(_) => 66,
            CommandError::PathConflict(_) => 2,
            CommandError::DuplicateKey(_) => 11000,
            CommandError::NoSuchTransaction => 251,
            CommandError::CommandNotFound(_) => 59,
            CommandError::NamespaceNotFound(_) => 26,
            CommandError::TransientInternal(_) => 1,
        }
    }

    pub fn code_name(&self) -> &'static str {
        match self {
            CommandError::BadValue(_) => "BadValue",
            CommandError::TypeMismatch(_) => "TypeMismatch",
            CommandError::ImmutableField(_) => "ImmutableField",
            CommandError::PathConflict(_) => "PathConflict",
            CommandError::DuplicateKey(_) => "DuplicateKey",
            CommandError::NoSuchTransaction => "NoSuchTransaction",
            CommandError::CommandNotFound(_) => "CommandNotFound",
            CommandError::NamespaceNotFound(_) => "NamespaceNotFound",
            CommandError::TransientInternal(_) => "TransientInternal",
        }
    }
}

/// Connection-scoped framing failures. These never become a response
/// document; they close the offending connection only.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(i32),

    #[error("unsupported OP_MSG section kind {0}")]
    UnsupportedSectionKind(u8),

    #[error("malformed message frame: {0}")]
    Framing(String),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bson decode error: {0}")]
    Bson(#[from] bson::de::Error),

    #[error("bson encode error: {0}")]
    BsonEnc(#[from] bson::ser::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = StdResult<T, Error>;
