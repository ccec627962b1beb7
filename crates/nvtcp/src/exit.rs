use std::fmt;
use std::io;

use nvtcp_pdu::PduError;
use nvtcp_qpair::QpairError;
use nvtcp_wire::WireError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn wire_error(context: &str, err: WireError) -> CliError {
    match err {
        WireError::Connect { source, .. } | WireError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn pdu_error(context: &str, err: PduError) -> CliError {
    match err {
        PduError::Io(source) => io_error(context, source),
        PduError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn qpair_error(context: &str, err: QpairError) -> CliError {
    match err {
        QpairError::Wire(err) => wire_error(context, err),
        QpairError::Pdu(err) => pdu_error(context, err),
        QpairError::InvalidConfig(_) | QpairError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        QpairError::InvalidCapsule(_) | QpairError::WrongRole { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other if other.is_fatal() => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}
