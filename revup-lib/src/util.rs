//! Utility functions.

use std::error::Error;
use std::fmt::Display;

/// Represents the code to exit the process with.
#[must_use]
#[derive(Copy, Clone, Debug)]
pub struct ExitCode(pub isize);

impl ExitCode {
    /// Determine whether or not this exit code represents a successful
    /// termination.
    pub fn is_success(&self) -> bool {
        match self {
            ExitCode(0) => true,
            ExitCode(_) => false,
        }
    }

    /// Convert the exit code into an `i32`, or use the default failure exit
    /// code if conversion fails.
    pub fn into_i32_or_default(self) -> i32 {
        let Self(exit_code) = self;
        exit_code.try_into().unwrap_or(1)
    }
}

impl Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self(exit_code) = self;
        write!(f, "exit code {exit_code}")
    }
}

impl Error for ExitCode {}

/// Helper type to wrap situations where we might return any normal error
/// (wrapped by `eyre::Result`) or an `ExitCode`.
pub type EyreExitOr<T> = eyre::Result<Result<T, ExitCode>>;

/// Macro to propagate the early-exit case of an [`EyreExitOr`] expression to
/// the calling function.
#[macro_export]
macro_rules! try_exit_code {
    ($e:expr) => {
        match $e {
            Ok(result) => result,
            Err(exit_code) => {
                return Ok(Err(exit_code));
            }
        }
    };
}
