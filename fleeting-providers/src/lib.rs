use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Provider error codes meaning "the group is busy, try a softer operation".
const BUSY_CODES: &[&str] = &["ResourceInUse", "ScalingActivityInProgress"];

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provider answered and refused the request.
    #[error("{code}: {message}")]
    Api { code: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn api(code: &str, message: &str) -> Self {
        ProviderError::Api {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Short code surfaced to callers as `ERROR:{code}`.
    pub fn code(&self) -> &str {
        match self {
            ProviderError::Api { code, .. } => code.as_str(),
            ProviderError::Transport(_) => "Transport",
            ProviderError::Malformed(_) => "MalformedResponse",
            ProviderError::Config(_) => "Config",
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, ProviderError::Api { code, .. } if BUSY_CODES.contains(&code.as_str()))
    }
}

/// Compute + autoscaling API the fleet runs on.
///
/// Every method is one provider round-trip with the implementation's own timeout.
/// "Not found" on list/describe calls is an empty result, never an error.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// Instances carrying tag `tag_key` whose state is one of `states`.
    async fn list_instances(
        &self,
        tag_key: &str,
        states: &[&str],
    ) -> Result<Vec<inventory::DiscoveredInstance>>;

    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<inventory::DiscoveredInstance>>;

    async fn set_instance_tag(&self, instance_id: &str, key: &str, value: &str) -> Result<()>;

    // Serial console text; None when the provider has nothing yet.
    async fn console_output(&self, instance_id: &str) -> Result<Option<String>>;

    async fn create_launch_configuration(
        &self,
        spec: &inventory::LaunchConfigurationSpec,
    ) -> Result<()>;

    async fn delete_launch_configuration(&self, name: &str) -> Result<()>;

    async fn list_launch_configurations(
        &self,
        names: &[String],
    ) -> Result<Vec<inventory::LaunchConfiguration>>;

    async fn create_autoscaling_group(&self, spec: &inventory::AutoscalingGroupSpec)
        -> Result<()>;

    async fn delete_autoscaling_group(&self, name: &str) -> Result<()>;

    async fn list_autoscaling_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<inventory::AutoscalingGroup>>;

    /// Scale the group to zero (min = max = desired = 0) without deleting it.
    async fn shutdown_autoscaling_group(&self, name: &str) -> Result<()>;

    /// Schedule a one-shot capacity change (min = max = desired = `capacity`) at `at`.
    async fn schedule_capacity_change(
        &self,
        group_name: &str,
        action_name: &str,
        at: DateTime<Utc>,
        capacity: u32,
    ) -> Result<()>;

    /// Publish the group's instance-termination events to `topic`.
    async fn subscribe_termination_notifications(&self, group_name: &str, topic: &str)
        -> Result<()>;
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct DiscoveredInstance {
        pub instance_id: String,
        /// Raw provider state (`pending`, `running`, `terminated`, ...).
        pub state: String,
        pub public_host: Option<String>,
        pub launch_time: Option<DateTime<Utc>>,
        pub tags: HashMap<String, String>,
    }

    impl DiscoveredInstance {
        pub fn tag(&self, key: &str) -> Option<&str> {
            self.tags.get(key).map(|v| v.as_str())
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct GroupInstance {
        pub instance_id: String,
        pub lifecycle_state: String,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct AutoscalingGroup {
        pub name: String,
        pub launch_configuration: Option<String>,
        pub min_size: u32,
        pub max_size: u32,
        pub desired_capacity: u32,
        pub instances: Vec<GroupInstance>,
        pub tags: HashMap<String, String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct LaunchConfiguration {
        pub name: String,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct LaunchConfigurationSpec {
        pub name: String,
        pub image_id: String,
        pub instance_type: String,
        pub key_name: String,
        pub security_groups: Vec<String>,
        pub user_data: String,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct GroupTag {
        pub key: String,
        pub value: String,
        pub propagate_at_launch: bool,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct AutoscalingGroupSpec {
        pub name: String,
        pub launch_configuration: String,
        pub availability_zones: Vec<String>,
        pub min_size: u32,
        pub max_size: u32,
        pub desired_capacity: u32,
        pub tags: Vec<GroupTag>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct ScheduledAction {
        pub group_name: String,
        pub action_name: String,
        pub at: DateTime<Utc>,
        pub capacity: u32,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "aws")]
pub mod aws;

#[cfg(feature = "aws")]
mod sigv4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_codes() {
        assert!(ProviderError::api("ResourceInUse", "x").is_busy());
        assert!(ProviderError::api("ScalingActivityInProgress", "x").is_busy());
        assert!(!ProviderError::api("ValidationError", "x").is_busy());
        assert!(!ProviderError::Transport("timeout".into()).is_busy());
    }

    #[test]
    fn error_codes() {
        assert_eq!(ProviderError::api("Throttling", "slow down").code(), "Throttling");
        assert_eq!(ProviderError::Transport("x".into()).code(), "Transport");
        assert_eq!(
            ProviderError::api("Throttling", "slow down").to_string(),
            "Throttling: slow down"
        );
    }
}
