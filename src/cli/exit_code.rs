//! Exit code definitions for sshproxy
//!
//! Provides standardized exit codes for different error conditions.

use crate::Error;

/// Exit codes for the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// General/unspecified error
    GeneralError = 1,
    /// Configuration error (invalid config, missing required settings)
    ConfigError = 2,
    /// Account service unreachable or answering with errors
    BackendError = 3,
    /// Cannot bind the listen address or load the host key
    ListenError = 4,
}

impl ExitCode {
    /// Pick the exit code for a failure bubbled up to `main`
    pub fn for_error(err: &anyhow::Error) -> Self {
        match err.chain().find_map(|cause| cause.downcast_ref::<Error>()) {
            Some(Error::Config(_)) | Some(Error::TomlParse(_)) => Self::ConfigError,
            Some(Error::Http(_)) | Some(Error::Backend(_)) | Some(Error::Json(_)) => Self::BackendError,
            Some(Error::Io(_)) | Some(Error::SshKey(_)) => Self::ListenError,
            _ => Self::GeneralError,
        }
    }
}

impl From<ExitCode> for u8 {
    fn from(code: ExitCode) -> Self {
        code as u8
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(u8::from(ExitCode::Success), 0);
        assert_eq!(u8::from(ExitCode::ListenError), 4);
    }

    #[test]
    fn test_for_error_looks_through_context() {
        let err: anyhow::Result<()> = Err(Error::Config("bad".to_string())).context("loading");
        assert_eq!(ExitCode::for_error(&err.unwrap_err()), ExitCode::ConfigError);

        let err: anyhow::Result<()> = Err(Error::Backend("no such key".to_string())).context("settings");
        assert_eq!(ExitCode::for_error(&err.unwrap_err()), ExitCode::BackendError);

        assert_eq!(ExitCode::for_error(&anyhow::anyhow!("other")), ExitCode::GeneralError);
    }
}
