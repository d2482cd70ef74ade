//! Error types for stxauto

use std::time::Duration;
use thiserror::Error;

use crate::deploy::Stage;

/// Errors that can occur anywhere in the session engine or the installer.
///
/// Every layer of the crate returns `Result<T, Error>`. The variants fall into
/// a few classes which callers usually care about more than the exact variant:
///
/// - transport failures that may go away on their own ([`Error::is_retryable`])
/// - credential failures, which are never retried ([`Error::is_credential`])
/// - registry lookups and configuration problems
/// - deployment stage failures
///
/// # Examples
///
/// ```no_run
/// use stxauto::{Error, Session};
/// use stxauto::session::ConnectOptions;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut session = Session::ssh("10.10.10.3", "sysadmin", "Li69nux*");
///
/// match session.connect(ConnectOptions::default().retry(true)).await {
///     Ok(()) => println!("connected"),
///     Err(Error::PermissionDenied { host, .. }) => eprintln!("bad credentials for {host}"),
///     Err(Error::RetryTimeout { host, .. }) => eprintln!("{host} never came up"),
///     Err(e) => return Err(e.into()),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// Timeout waiting for a pattern.
    ///
    /// `patterns` lists what was expected and `pending` holds the tail of the
    /// output that was received but never matched.
    #[error("Timeout waiting for {patterns} (after {duration:?})")]
    Timeout {
        /// Display form of the expected patterns
        patterns: String,
        /// Duration that was waited before timeout
        duration: Duration,
        /// Unconsumed output at the time of the timeout
        pending: String,
    },

    /// The far end closed the stream before a pattern matched.
    #[error("EOF reached while waiting for {patterns}")]
    Eof {
        /// Display form of the expected patterns
        patterns: String,
    },

    /// Invalid pattern.
    #[error("Invalid pattern: {0}")]
    PatternError(#[from] PatternError),

    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// PTY creation or manipulation failed.
    #[error("PTY error: {0}")]
    PtyError(String),

    /// The transport command could not be spawned.
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    /// A send/expect was attempted on a session without a live transport.
    #[error("Session to {host} is not connected")]
    NotConnected {
        /// Logical host of the session
        host: String,
    },

    /// The remote end refused the connection.
    #[error("Connection to {host} refused")]
    ConnectionRefused {
        /// Host that refused
        host: String,
    },

    /// The login sequence ended somewhere other than the expected prompt.
    #[error("Unable to connect to {host}: {reason}")]
    Connection {
        /// Host being connected to
        host: String,
        /// What went wrong
        reason: String,
    },

    /// Credentials were rejected. Never retried.
    #[error("Login credentials denied by {host}. User: {user}")]
    PermissionDenied {
        /// Host that rejected the credentials
        host: String,
        /// User that was rejected
        user: String,
    },

    /// Retrying a connection did not succeed within the retry budget.
    #[error("Retry timeout connecting to {host} as {user}")]
    RetryTimeout {
        /// Host being connected to
        host: String,
        /// User being connected as
        user: String,
    },

    /// A command returned a non-zero exit code and the caller asked for that to fail.
    #[error("Non-zero return code {code} for cmd: {command}")]
    CommandFailed {
        /// Command that was run
        command: String,
        /// Its exit code
        code: i32,
    },

    /// Output could not be interpreted.
    #[error("Unexpected output for {command}: {output:?}")]
    UnexpectedOutput {
        /// Command whose output was parsed
        command: String,
        /// The output in question
        output: String,
    },

    /// No active controller session is registered for the lab.
    #[error("No active controller session set for {lab}")]
    ActiveControllerUnset {
        /// Lab key that was looked up
        lab: String,
    },

    /// No NAT box session has been set.
    #[error("No NAT box client set")]
    NatBoxUnset,

    /// The NAT box address is not in the known NAT box list.
    #[error("No matching NAT box found for {0}")]
    UnknownNatBox(String),

    /// A keyless lookup found more than one candidate.
    #[error("{count} {kind} sessions registered; a key is required")]
    AmbiguousSession {
        /// Which registry was consulted
        kind: &'static str,
        /// How many candidates were found
        count: usize,
    },

    /// A required configuration variable is absent.
    #[error("Missing configuration variable: {0}")]
    MissingVar(String),

    /// A configuration variable has an unusable value.
    #[error("Invalid value for {key}: {value}")]
    InvalidVar {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },

    /// The configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A polled condition never held within its budget.
    #[error("Timed out after {timeout:?} waiting for {what}")]
    PollTimeout {
        /// Condition that was being waited for
        what: String,
        /// Total budget that elapsed
        timeout: Duration,
    },

    /// A deployment stage did not reach its exit condition.
    #[error("{stage} failed: {reason}")]
    StageFailed {
        /// Stage that failed
        stage: Stage,
        /// Why it failed
        reason: String,
    },

    /// The deployment driver aborted at `stage`.
    #[error("Deployment aborted at {stage}: {source}")]
    Deploy {
        /// Stage the driver was running
        stage: Stage,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether a connect attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::Eof { .. }
                | Error::IoError(_)
                | Error::ConnectionRefused { .. }
                | Error::Connection { .. }
                | Error::NotConnected { .. }
        )
    }

    /// Whether this error means the credentials were rejected.
    pub fn is_credential(&self) -> bool {
        matches!(self, Error::PermissionDenied { .. })
    }

    /// The stage a deployment failure belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::StageFailed { stage, .. } | Error::Deploy { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Errors related to pattern creation.
#[derive(Error, Debug)]
pub enum PatternError {
    /// Invalid regex pattern.
    #[error("Invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// Empty pattern.
    #[error("Pattern cannot be empty")]
    EmptyPattern,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        let timeout = Error::Timeout {
            patterns: "'login:'".into(),
            duration: Duration::from_secs(1),
            pending: String::new(),
        };
        assert!(timeout.is_retryable());
        assert!(Error::Eof {
            patterns: String::new()
        }
        .is_retryable());
        assert!(Error::IoError(std::io::Error::other("reset")).is_retryable());

        let denied = Error::PermissionDenied {
            host: "h".into(),
            user: "u".into(),
        };
        assert!(!denied.is_retryable());
        assert!(denied.is_credential());
    }

    #[test]
    fn test_stage_of_error() {
        let err = Error::Deploy {
            stage: Stage::AnsibleBootstrap,
            source: Box::new(Error::StageFailed {
                stage: Stage::AnsibleBootstrap,
                reason: "failed=2".into(),
            }),
        };
        assert_eq!(err.stage(), Some(Stage::AnsibleBootstrap));
        assert!(err.to_string().contains("Step 5"));
        assert_eq!(Error::NatBoxUnset.stage(), None);
    }
}
