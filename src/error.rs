//! Return codes of the runtime.
//!
//! Every public primitive returns a [DartResult]. The numeric view of a result,
//! as used by foreign callers and trace output, is [DartRet].

/// The error half of a [DartResult]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DartError {
    /// A non-blocking operation has not finished yet
    Pending,
    /// An argument was out of range or otherwise malformed
    Inval,
    /// A team, segment, allocation or task could not be found
    NotFound,
    /// The runtime was not initialized or was already finalized
    NotInit,
    /// Any other failure
    Other,
}

impl std::fmt::Display for DartError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DartError::Pending => write!(f, "operation still pending"),
            DartError::Inval => write!(f, "invalid argument"),
            DartError::NotFound => write!(f, "entity not found"),
            DartError::NotInit => write!(f, "runtime not initialized"),
            DartError::Other => write!(f, "unspecified runtime error"),
        }
    }
}

impl std::error::Error for DartError {}

impl From<anyhow::Error> for DartError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("internal error: {err:?}");
        DartError::Other
    }
}

/// Result type returned by the runtime's operations
pub type DartResult<T> = Result<T, DartError>;

/// Numeric return codes
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DartRet {
    Ok = 0,
    Pending = 1,
    ErrInval = 2,
    ErrNotFound = 3,
    ErrNotInit = 4,
    ErrOther = 999,
}

impl From<DartError> for DartRet {
    fn from(err: DartError) -> Self {
        match err {
            DartError::Pending => DartRet::Pending,
            DartError::Inval => DartRet::ErrInval,
            DartError::NotFound => DartRet::ErrNotFound,
            DartError::NotInit => DartRet::ErrNotInit,
            DartError::Other => DartRet::ErrOther,
        }
    }
}

impl<T> From<&DartResult<T>> for DartRet {
    fn from(res: &DartResult<T>) -> Self {
        match res {
            Ok(_) => DartRet::Ok,
            Err(e) => (*e).into(),
        }
    }
}

impl std::fmt::Display for DartRet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            DartRet::Ok => "DART_OK",
            DartRet::Pending => "DART_PENDING",
            DartRet::ErrInval => "DART_ERR_INVAL",
            DartRet::ErrNotFound => "DART_ERR_NOTFOUND",
            DartRet::ErrNotInit => "DART_ERR_NOTINIT",
            DartRet::ErrOther => "DART_ERR_OTHER",
        };
        write!(f, "{name}")
    }
}
