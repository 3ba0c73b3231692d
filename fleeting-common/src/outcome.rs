use serde::Serialize;
use std::fmt;

use crate::InstanceState;

// -----------------------------------------------------------------------------
// create()
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Done,
    InvalidGitInfo,
    InstanceAlreadyExists,
}

impl CreateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreateOutcome::Done => "DONE",
            CreateOutcome::InvalidGitInfo => "INVALID_GIT_INFO",
            CreateOutcome::InstanceAlreadyExists => "INSTANCE_ALREADY_EXISTS",
        }
    }
}

impl fmt::Display for CreateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// destroy()
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyOutcome {
    Done,
    ShutdownInProgress,
    NotFound,
    /// Provider failure, carrying the provider's error code.
    Error(String),
}

impl DestroyOutcome {
    pub fn code(&self) -> String {
        match self {
            DestroyOutcome::Done => "DONE".to_string(),
            DestroyOutcome::ShutdownInProgress => "SHUTDOWN_IN_PROGRESS".to_string(),
            DestroyOutcome::NotFound => "NOT_FOUND".to_string(),
            DestroyOutcome::Error(code) => format!("ERROR:{}", code),
        }
    }
}

impl fmt::Display for DestroyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

// -----------------------------------------------------------------------------
// status()
// -----------------------------------------------------------------------------

/// Answer of `status(slug)` and of a readiness probe.
///
/// The three "nothing there" variants are distinct on purpose: callers word their
/// messages differently for a slug that never existed, one still launching and one
/// already reclaimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    NotFound,
    DoesNotYetExist,
    DoesNotExist,
    Ready { url: String },
    Instance {
        state: InstanceState,
        info: Option<String>,
    },
}

impl InstanceStatus {
    pub fn code(&self) -> String {
        match self {
            InstanceStatus::NotFound => "NOT_FOUND".to_string(),
            InstanceStatus::DoesNotYetExist => "INSTANCE_DOES_NOT_YET_EXIST".to_string(),
            InstanceStatus::DoesNotExist => "INSTANCE_DOES_NOT_EXIST".to_string(),
            InstanceStatus::Ready { .. } => "READY".to_string(),
            InstanceStatus::Instance { state, .. } => format!("INSTANCE:{}", state),
        }
    }

    /// Ready URL for `READY`, error text for a failed probe, otherwise nothing.
    pub fn info(&self) -> Option<&str> {
        match self {
            InstanceStatus::Ready { url } => Some(url.as_str()),
            InstanceStatus::Instance { info, .. } => info.as_deref(),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, InstanceStatus::Ready { .. })
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

// -----------------------------------------------------------------------------
// cleanup()
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted: usize,
    pub errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_codes_are_stable() {
        assert_eq!(CreateOutcome::Done.as_str(), "DONE");
        assert_eq!(CreateOutcome::InvalidGitInfo.as_str(), "INVALID_GIT_INFO");
        assert_eq!(
            CreateOutcome::InstanceAlreadyExists.as_str(),
            "INSTANCE_ALREADY_EXISTS"
        );
        assert_eq!(DestroyOutcome::ShutdownInProgress.code(), "SHUTDOWN_IN_PROGRESS");
        assert_eq!(DestroyOutcome::NotFound.code(), "NOT_FOUND");
        assert_eq!(
            DestroyOutcome::Error("ValidationError".into()).code(),
            "ERROR:ValidationError"
        );
    }

    #[test]
    fn status_codes_and_info() {
        assert_eq!(InstanceStatus::NotFound.code(), "NOT_FOUND");
        assert_eq!(
            InstanceStatus::DoesNotYetExist.code(),
            "INSTANCE_DOES_NOT_YET_EXIST"
        );
        assert_eq!(InstanceStatus::DoesNotExist.code(), "INSTANCE_DOES_NOT_EXIST");

        let ready = InstanceStatus::Ready {
            url: "http://h:8888/".into(),
        };
        assert_eq!(ready.code(), "READY");
        assert_eq!(ready.info(), Some("http://h:8888/"));

        let booting = InstanceStatus::Instance {
            state: InstanceState::Running,
            info: Some("connection refused".into()),
        };
        assert_eq!(booting.code(), "INSTANCE:running");
        assert_eq!(booting.info(), Some("connection refused"));
        assert_eq!(InstanceStatus::NotFound.info(), None);
    }
}
