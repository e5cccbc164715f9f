use std::fmt;
use std::io;

use objipc_client::ClientError;
use objipc_wire::WireError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const WIRE_ERROR: i32 = 3;
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
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn client_error(context: &str, err: ClientError) -> CliError {
    match err {
        ClientError::Connect { source, .. } => io_error(context, source),
        ClientError::NoRuntimeDir | ClientError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        ClientError::Wire(WireError::Io(source)) => io_error(context, source),
        ClientError::Wire(WireError::Closed) => CliError::new(FAILURE, format!("{context}: {err}")),
        ClientError::Wire(_) => CliError::new(WIRE_ERROR, format!("{context}: {err}")),
        ClientError::Codec(_) | ClientError::Protocol { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_maps_to_dedicated_code() {
        let err = io_error(
            "connect",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.code, PERMISSION_DENIED);
    }

    #[test]
    fn missing_runtime_dir_is_usage_error() {
        let err = client_error("connect", ClientError::NoRuntimeDir);
        assert_eq!(err.code, USAGE);
    }
}
