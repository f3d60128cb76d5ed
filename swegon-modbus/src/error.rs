use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[cfg(feature = "rtu")]
    #[error(transparent)]
    SerialError(#[from] tokio_serial::Error),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Expected {expected} registers for {group}, got {actual}")]
    Decode {
        group: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{0} is not part of the device profile")]
    MissingGroup(&'static str),

    #[error("{group}/{key} not found")]
    NotFound { group: String, key: String },

    #[error("{group}/{key} is not writable")]
    ReadOnly { group: &'static str, key: String },

    #[error("Cannot encode {value} for {key}")]
    Encode { key: String, value: f64 },

    #[error("Writing {group}/{key} failed: {source}")]
    Write {
        group: &'static str,
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Unrecognised modbus protocol")]
    UnrecognisedModbusProtocol,

    #[error("{0}")]
    Other(std::borrow::Cow<'static, str>),
}

impl Error {
    /// Connection, timeout and wire-level failures. Retried on the next poll or user action.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::IOError(_) | Error::Timeout(_) | Error::NotConnected => true,
            #[cfg(feature = "rtu")]
            Error::SerialError(_) => true,
            Error::Write { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// The device answered, but not with the number of registers the group needs.
    pub fn is_decode(&self) -> bool {
        match self {
            Error::Decode { .. } => true,
            Error::Write { source, .. } => source.is_decode(),
            _ => false,
        }
    }

    pub(crate) fn not_found(group: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            group: group.into(),
            key: key.into(),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Other(s.into())
    }
}
impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Self::Other(s.into())
    }
}

#[test]
fn write_errors_keep_their_cause_class() {
    let err = Error::Write {
        group: "Setpoints",
        key: "Temp_SP".to_owned(),
        source: Box::new(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into()),
    };
    assert!(err.is_transport());
    assert!(!err.is_decode());
    assert_eq!(
        err.to_string(),
        "Writing Setpoints/Temp_SP failed: broken pipe"
    );
}
