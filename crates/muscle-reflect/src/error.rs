// Error values returned by tree and session operations.  There is no
// exception control flow: callers convert these to per-session disconnects,
// log-and-continue, or error replies to the client.
pub type Result<T> = std::result::Result<T, ReflectError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReflectError {
    #[error("out of memory or resource budget: {0}")]
    OutOfMemory(&'static str),
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("malformed data: {0}")]
    BadData(String),
    #[error("not found: {0}")]
    DataNotFound(String),
    #[error("operation invalid for current state: {0}")]
    BadObject(&'static str),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("timed out")]
    Timeout,
    #[error("unimplemented what-code {0:#010x}")]
    Unimplemented(u32),
}

impl ReflectError {
    /// Stable numeric code carried in error replies on the wire.
    pub fn code(&self) -> i32 {
        match self {
            ReflectError::OutOfMemory(_) => 1,
            ReflectError::BadArgument(_) => 2,
            ReflectError::BadData(_) => 3,
            ReflectError::DataNotFound(_) => 4,
            ReflectError::BadObject(_) => 5,
            ReflectError::AccessDenied(_) => 6,
            ReflectError::Io(_) => 7,
            ReflectError::Timeout => 8,
            ReflectError::Unimplemented(_) => 9,
        }
    }
}

impl From<muscle_wire::Error> for ReflectError {
    fn from(err: muscle_wire::Error) -> Self {
        match err {
            muscle_wire::Error::NotFound(name) => {
                ReflectError::BadArgument(format!("missing request field {name}"))
            }
            muscle_wire::Error::TypeMismatch { .. } => {
                ReflectError::BadArgument(err.to_string())
            }
            other => ReflectError::BadData(other.to_string()),
        }
    }
}
