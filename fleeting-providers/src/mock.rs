use crate::inventory::{
    AutoscalingGroup, AutoscalingGroupSpec, DiscoveredInstance, LaunchConfiguration,
    LaunchConfigurationSpec, ScheduledAction,
};
use crate::{FleetProvider, ProviderError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListInstances,
    DescribeInstances,
    SetInstanceTag,
    ConsoleOutput,
    CreateLaunchConfiguration,
    DeleteLaunchConfiguration,
    ListLaunchConfigurations,
    CreateAutoscalingGroup,
    DeleteAutoscalingGroup,
    ListAutoscalingGroups,
    ShutdownAutoscalingGroup,
    ScheduleCapacityChange,
    SubscribeTerminationNotifications,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    /// Resource the call addressed (group/config/instance name, tag key for listings).
    pub target: String,
}

#[derive(Default)]
struct MockState {
    instances: Vec<DiscoveredInstance>,
    groups: BTreeMap<String, AutoscalingGroup>,
    launch_configs: BTreeMap<String, Option<LaunchConfigurationSpec>>,
    scheduled: Vec<ScheduledAction>,
    subscriptions: Vec<(String, String)>,
    console: HashMap<String, String>,
    failures: HashMap<(MockOp, Option<String>), ProviderError>,
    calls: Vec<MockCall>,
}

impl MockState {
    fn record(&mut self, op: MockOp, target: &str) -> Result<()> {
        self.calls.push(MockCall {
            op,
            target: target.to_string(),
        });
        if let Some(err) = self.failures.get(&(op, Some(target.to_string()))) {
            return Err(err.clone());
        }
        if let Some(err) = self.failures.get(&(op, None)) {
            return Err(err.clone());
        }
        Ok(())
    }
}

/// In-memory provider with the same failure modes as the real API surface
/// (duplicate names, deleting busy groups or in-use launch configurations).
///
/// Nothing launches on its own: tests place instances with `add_instance` and attach
/// them to groups with `add_group`.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

fn not_found(kind: &str, name: &str) -> ProviderError {
    ProviderError::api("ValidationError", &format!("{} name not found - {}", kind, name))
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_instance(&self, instance: DiscoveredInstance) {
        let mut st = self.state();
        st.instances.retain(|i| i.instance_id != instance.instance_id);
        st.instances.push(instance);
    }

    pub fn add_group(&self, group: AutoscalingGroup) {
        self.state().groups.insert(group.name.clone(), group);
    }

    pub fn add_launch_configuration(&self, name: &str) {
        self.state().launch_configs.insert(name.to_string(), None);
    }

    pub fn set_console_output(&self, instance_id: &str, text: &str) {
        self.state()
            .console
            .insert(instance_id.to_string(), text.to_string());
    }

    /// Make every `op` call addressing `target` fail with `err`.
    pub fn fail_on(&self, op: MockOp, target: &str, err: ProviderError) {
        self.state()
            .failures
            .insert((op, Some(target.to_string())), err);
    }

    /// Make every `op` call fail with `err`, whatever it addresses.
    pub fn fail_all(&self, op: MockOp, err: ProviderError) {
        self.state().failures.insert((op, None), err);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn calls_for(&self, op: MockOp, target: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op && c.target == target)
            .count()
    }

    pub fn group(&self, name: &str) -> Option<AutoscalingGroup> {
        self.state().groups.get(name).cloned()
    }

    pub fn launch_configuration(&self, name: &str) -> Option<LaunchConfigurationSpec> {
        self.state().launch_configs.get(name).cloned().flatten()
    }

    pub fn has_launch_configuration(&self, name: &str) -> bool {
        self.state().launch_configs.contains_key(name)
    }

    pub fn scheduled_actions(&self) -> Vec<ScheduledAction> {
        self.state().scheduled.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.state().subscriptions.clone()
    }

    pub fn instance_tag(&self, instance_id: &str, key: &str) -> Option<String> {
        self.state()
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id)
            .and_then(|i| i.tags.get(key).cloned())
    }
}

#[async_trait]
impl FleetProvider for MockProvider {
    async fn list_instances(
        &self,
        tag_key: &str,
        states: &[&str],
    ) -> Result<Vec<DiscoveredInstance>> {
        let mut st = self.state();
        st.record(MockOp::ListInstances, tag_key)?;
        Ok(st
            .instances
            .iter()
            .filter(|i| i.tags.contains_key(tag_key) && states.contains(&i.state.as_str()))
            .cloned()
            .collect())
    }

    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<DiscoveredInstance>> {
        let mut st = self.state();
        st.record(MockOp::DescribeInstances, &instance_ids.join(","))?;
        Ok(st
            .instances
            .iter()
            .filter(|i| instance_ids.contains(&i.instance_id))
            .cloned()
            .collect())
    }

    async fn set_instance_tag(&self, instance_id: &str, key: &str, value: &str) -> Result<()> {
        let mut st = self.state();
        st.record(MockOp::SetInstanceTag, instance_id)?;
        let instance = st
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| {
                ProviderError::api(
                    "InvalidInstanceID.NotFound",
                    &format!("The instance ID '{}' does not exist", instance_id),
                )
            })?;
        instance.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn console_output(&self, instance_id: &str) -> Result<Option<String>> {
        let mut st = self.state();
        st.record(MockOp::ConsoleOutput, instance_id)?;
        Ok(st.console.get(instance_id).cloned())
    }

    async fn create_launch_configuration(&self, spec: &LaunchConfigurationSpec) -> Result<()> {
        let mut st = self.state();
        st.record(MockOp::CreateLaunchConfiguration, &spec.name)?;
        if st.launch_configs.contains_key(&spec.name) {
            return Err(ProviderError::api(
                "AlreadyExists",
                &format!("Launch Configuration by this name already exists - {}", spec.name),
            ));
        }
        st.launch_configs.insert(spec.name.clone(), Some(spec.clone()));
        Ok(())
    }

    async fn delete_launch_configuration(&self, name: &str) -> Result<()> {
        let mut st = self.state();
        st.record(MockOp::DeleteLaunchConfiguration, name)?;
        if !st.launch_configs.contains_key(name) {
            return Err(not_found("Launch configuration", name));
        }
        let in_use = st
            .groups
            .values()
            .any(|g| g.launch_configuration.as_deref() == Some(name));
        if in_use {
            return Err(ProviderError::api(
                "ResourceInUse",
                &format!(
                    "Cannot delete launch configuration {} because it is attached to \
                     AutoScalingGroup",
                    name
                ),
            ));
        }
        st.launch_configs.remove(name);
        Ok(())
    }

    async fn list_launch_configurations(
        &self,
        names: &[String],
    ) -> Result<Vec<LaunchConfiguration>> {
        let mut st = self.state();
        st.record(MockOp::ListLaunchConfigurations, &names.join(","))?;
        Ok(names
            .iter()
            .filter(|n| st.launch_configs.contains_key(n.as_str()))
            .map(|n| LaunchConfiguration { name: n.clone() })
            .collect())
    }

    async fn create_autoscaling_group(&self, spec: &AutoscalingGroupSpec) -> Result<()> {
        let mut st = self.state();
        st.record(MockOp::CreateAutoscalingGroup, &spec.name)?;
        if st.groups.contains_key(&spec.name) {
            return Err(ProviderError::api(
                "AlreadyExists",
                &format!("AutoScalingGroup by this name already exists - {}", spec.name),
            ));
        }
        if !st.launch_configs.contains_key(&spec.launch_configuration) {
            return Err(not_found("Launch configuration", &spec.launch_configuration));
        }
        let group = AutoscalingGroup {
            name: spec.name.clone(),
            launch_configuration: Some(spec.launch_configuration.clone()),
            min_size: spec.min_size,
            max_size: spec.max_size,
            desired_capacity: spec.desired_capacity,
            instances: Vec::new(),
            tags: spec
                .tags
                .iter()
                .map(|t| (t.key.clone(), t.value.clone()))
                .collect(),
        };
        st.groups.insert(spec.name.clone(), group);
        Ok(())
    }

    async fn delete_autoscaling_group(&self, name: &str) -> Result<()> {
        let mut st = self.state();
        st.record(MockOp::DeleteAutoscalingGroup, name)?;
        let group = st.groups.get(name).ok_or_else(|| not_found("AutoScalingGroup", name))?;
        if !group.instances.is_empty() {
            return Err(ProviderError::api(
                "ResourceInUse",
                "You cannot delete an AutoScalingGroup while there are instances still in the \
                 group.",
            ));
        }
        st.groups.remove(name);
        Ok(())
    }

    async fn list_autoscaling_groups(&self, names: &[String]) -> Result<Vec<AutoscalingGroup>> {
        let mut st = self.state();
        st.record(MockOp::ListAutoscalingGroups, &names.join(","))?;
        Ok(names
            .iter()
            .filter_map(|n| st.groups.get(n).cloned())
            .collect())
    }

    async fn shutdown_autoscaling_group(&self, name: &str) -> Result<()> {
        let mut st = self.state();
        st.record(MockOp::ShutdownAutoscalingGroup, name)?;
        let group = st
            .groups
            .get_mut(name)
            .ok_or_else(|| not_found("AutoScalingGroup", name))?;
        group.min_size = 0;
        group.max_size = 0;
        group.desired_capacity = 0;
        Ok(())
    }

    async fn schedule_capacity_change(
        &self,
        group_name: &str,
        action_name: &str,
        at: DateTime<Utc>,
        capacity: u32,
    ) -> Result<()> {
        let mut st = self.state();
        st.record(MockOp::ScheduleCapacityChange, group_name)?;
        if !st.groups.contains_key(group_name) {
            return Err(not_found("AutoScalingGroup", group_name));
        }
        st.scheduled.push(ScheduledAction {
            group_name: group_name.to_string(),
            action_name: action_name.to_string(),
            at,
            capacity,
        });
        Ok(())
    }

    async fn subscribe_termination_notifications(
        &self,
        group_name: &str,
        topic: &str,
    ) -> Result<()> {
        let mut st = self.state();
        st.record(MockOp::SubscribeTerminationNotifications, group_name)?;
        if !st.groups.contains_key(group_name) {
            return Err(not_found("AutoScalingGroup", group_name));
        }
        st.subscriptions
            .push((group_name.to_string(), topic.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{GroupInstance, GroupTag};

    fn lc_spec(name: &str) -> LaunchConfigurationSpec {
        LaunchConfigurationSpec {
            name: name.to_string(),
            image_id: "ami-1".into(),
            instance_type: "t1.micro".into(),
            key_name: "key".into(),
            security_groups: vec!["sg".into()],
            user_data: "#!/bin/sh".into(),
        }
    }

    fn group_spec(name: &str, lc: &str) -> AutoscalingGroupSpec {
        AutoscalingGroupSpec {
            name: name.to_string(),
            launch_configuration: lc.to_string(),
            availability_zones: vec!["us-east-1a".into()],
            min_size: 1,
            max_size: 1,
            desired_capacity: 1,
            tags: vec![GroupTag {
                key: "fleeting:p".into(),
                value: "{}".into(),
                propagate_at_launch: true,
            }],
        }
    }

    #[tokio::test]
    async fn group_lifecycle_and_busy_delete() {
        let p = MockProvider::new();
        p.create_launch_configuration(&lc_spec("lc")).await.unwrap();
        p.create_autoscaling_group(&group_spec("g", "lc")).await.unwrap();
        assert!(p.create_autoscaling_group(&group_spec("g", "lc")).await.is_err());

        let err = p.delete_launch_configuration("lc").await.unwrap_err();
        assert_eq!(err.code(), "ResourceInUse");

        let mut g = p.group("g").unwrap();
        g.instances.push(GroupInstance {
            instance_id: "i-1".into(),
            lifecycle_state: "InService".into(),
        });
        p.add_group(g);
        let err = p.delete_autoscaling_group("g").await.unwrap_err();
        assert!(err.is_busy());

        p.shutdown_autoscaling_group("g").await.unwrap();
        assert_eq!(p.group("g").unwrap().min_size, 0);
        assert_eq!(p.calls_for(MockOp::DeleteAutoscalingGroup, "g"), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_recorded() {
        let p = MockProvider::new();
        p.add_launch_configuration("lc");
        p.fail_on(
            MockOp::DeleteLaunchConfiguration,
            "lc",
            ProviderError::api("Throttling", "slow down"),
        );
        let err = p.delete_launch_configuration("lc").await.unwrap_err();
        assert_eq!(err.code(), "Throttling");
        assert!(p.has_launch_configuration("lc"));
        assert_eq!(p.call_count(MockOp::DeleteLaunchConfiguration), 1);
    }

    #[tokio::test]
    async fn list_instances_filters_by_tag_and_state() {
        let p = MockProvider::new();
        let fleet = [
            ("i-1", "running", true),
            ("i-2", "terminated", true),
            ("i-3", "running", false),
        ];
        for (id, state, tag) in fleet {
            let mut tags = HashMap::new();
            if tag {
                tags.insert("fleeting:p".to_string(), "{}".to_string());
            }
            p.add_instance(DiscoveredInstance {
                instance_id: id.into(),
                state: state.into(),
                public_host: None,
                launch_time: None,
                tags,
            });
        }
        let found = p.list_instances("fleeting:p", &["running"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_id, "i-1");
    }
}
