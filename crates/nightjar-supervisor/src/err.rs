//! Supervisor error type.

use std::sync::Arc;

/// An error from starting, probing, or stopping a supervised daemon.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// No installed binary: the pointer file is absent.
    #[error("{network} is not installed")]
    NotInstalled {
        /// The network whose binary is missing.
        network: &'static str,
    },

    /// The daemon process would not spawn.
    #[error("could not spawn {program}")]
    SpawnFailed {
        /// The program we tried to run.
        program: String,
        /// What the OS said.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The daemon exited before its SOCKS port came up.
    #[error("{network} exited during startup: {tail}")]
    ExitedEarly {
        /// The network whose daemon died.
        network: &'static str,
        /// The last few KiB of its output.
        tail: String,
    },

    /// The SOCKS port never accepted a connection within the budget.
    #[error("{network} SOCKS port not ready after {budget_secs}s")]
    ReadinessTimeout {
        /// The network whose daemon stalled.
        network: &'static str,
        /// The startup budget that elapsed.
        budget_secs: u64,
    },

    /// Could not write the daemon's configuration file.
    #[error("could not write {network} configuration")]
    ConfigWrite {
        /// The network whose config failed.
        network: &'static str,
        /// The underlying error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The hidden-service hostname file never appeared.
    #[error("hidden service hostname not published within {budget_secs}s")]
    HiddenServiceTimeout {
        /// The wait budget that elapsed.
        budget_secs: u64,
    },

    /// Every candidate binary failed.
    ///
    /// The detail string lists each labeled attempt.
    #[error("all {network} binaries failed: {detail}")]
    AllCandidatesFailed {
        /// The network whose start failed.
        network: &'static str,
        /// Rendered composite of the per-candidate failures.
        detail: String,
    },

    /// Plain I/O failure.
    #[error("I/O error in supervisor")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        SupervisorError::Io(Arc::new(e))
    }
}

// Lets a `RetryError<SupervisorError>` render its labeled attempts.
impl AsRef<dyn std::error::Error + 'static> for SupervisorError {
    fn as_ref(&self) -> &(dyn std::error::Error + 'static) {
        self
    }
}
