//! rsvc agent - command-line administration for rsvc providers
//!
//! This crate provides a command-line interface for:
//! - Showing and exporting the local identity
//! - Listing, adding and revoking persisted authorization rules
//! - Checking how a request would be authorized
//! - Running an in-process provider and client as a smoke test

pub mod cli;
pub mod demo;
pub mod identity;
pub mod output;
pub mod rules;

pub use cli::Cli;
pub use output::{JsonResponse, OutputFormat, OutputFormatter};

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 2: Access denied by a rule or policy
/// - 3: Invalid input
/// - 4: Nothing matched (no such rule)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    AccessDenied = 2,
    InvalidInput = 3,
    NotFound = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::AccessDenied => "ACCESS_DENIED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::NotFound => "NOT_FOUND",
        }
    }
}

#[cfg(test)]
mod exit_code_tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(i32::from(ExitCode::Success), 0);
        assert_eq!(i32::from(ExitCode::GeneralError), 1);
        assert_eq!(i32::from(ExitCode::AccessDenied), 2);
        assert_eq!(i32::from(ExitCode::InvalidInput), 3);
        assert_eq!(i32::from(ExitCode::NotFound), 4);
    }

    #[test]
    fn test_exit_code_names() {
        assert_eq!(ExitCode::Success.name(), "SUCCESS");
        assert_eq!(ExitCode::AccessDenied.name(), "ACCESS_DENIED");
        assert_eq!(ExitCode::NotFound.name(), "NOT_FOUND");
    }
}
