use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub mod naming;
pub mod outcome;

pub use outcome::{CleanupReport, CreateOutcome, DestroyOutcome, InstanceStatus};

// --- Enums ---

/// Lifecycle state of an instance as seen by the fleet.
///
/// `Pending` and `Terminated` are written locally (cache overlay, tag payload at launch);
/// every other value is whatever the provider reports, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceState {
    Pending,
    Running,
    Terminated,
    Other(String),
}

impl InstanceState {
    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Terminated => "terminated",
            InstanceState::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "terminated" => InstanceState::Terminated,
            other => InstanceState::Other(other.to_string()),
        }
    }
}

impl From<String> for InstanceState {
    fn from(raw: String) -> Self {
        InstanceState::parse(&raw)
    }
}

impl From<InstanceState> for String {
    fn from(state: InstanceState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Records ---

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid instance record payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Payload stored in the provider tag `fleeting:{project}` and in cache entries.
///
/// The schema is fixed: unknown fields are rejected and every field must be present
/// (`lifetime` may be `null`, but not omitted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceRecord {
    pub slug: String,
    pub git_user: String,
    pub git_branch: String,
    pub state: InstanceState,
    #[serde(deserialize_with = "present_option")]
    pub lifetime: Option<u64>,
}

fn present_option<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

impl InstanceRecord {
    pub fn pending(slug: &str, git_user: &str, git_branch: &str, lifetime: Option<u64>) -> Self {
        Self {
            slug: slug.to_string(),
            git_user: git_user.to_string(),
            git_branch: git_branch.to_string(),
            state: InstanceState::Pending,
            lifetime,
        }
    }

    /// Tombstone written on destroy; only the slug and the state matter.
    pub fn terminated(slug: &str) -> Self {
        Self {
            slug: slug.to_string(),
            git_user: String::new(),
            git_branch: String::new(),
            state: InstanceState::Terminated,
            lifetime: None,
        }
    }

    pub fn encode(&self) -> String {
        // A struct of strings and integers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(raw)?)
    }
}

// --- Views ---

/// One entry of the merged instance listing for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub slug: String,
    pub git_user: String,
    pub git_branch: String,
    pub state: InstanceState,
    pub lifetime: Option<u64>,
    pub launch_time: Option<DateTime<Utc>>,
    pub ready_url: Option<String>,
    pub instance_id: Option<String>,
    pub public_host: Option<String>,
}

impl Instance {
    /// View of a cache-only entry the provider does not list yet.
    pub fn from_record(record: InstanceRecord) -> Self {
        Self {
            slug: record.slug,
            git_user: record.git_user,
            git_branch: record.git_branch,
            state: record.state,
            lifetime: record.lifetime,
            launch_time: None,
            ready_url: None,
            instance_id: None,
            public_host: None,
        }
    }
}
