use crate::inventory::{
    AutoscalingGroup, AutoscalingGroupSpec, DiscoveredInstance, GroupInstance,
    LaunchConfiguration, LaunchConfigurationSpec,
};
use crate::sigv4::{self, Credentials};
use crate::{FleetProvider, ProviderError, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;

const EC2_VERSION: &str = "2016-11-15";
const AUTOSCALING_VERSION: &str = "2011-01-01";
const TERMINATE_EVENT: &str = "autoscaling:EC2_INSTANCE_TERMINATE";

#[derive(Clone, Copy, Debug)]
enum Service {
    Ec2,
    AutoScaling,
}

impl Service {
    fn signing_name(self) -> &'static str {
        match self {
            Service::Ec2 => "ec2",
            Service::AutoScaling => "autoscaling",
        }
    }

    fn version(self) -> &'static str {
        match self {
            Service::Ec2 => EC2_VERSION,
            Service::AutoScaling => AUTOSCALING_VERSION,
        }
    }
}

/// EC2 + Auto Scaling over the Query API (form POST, XML answers).
pub struct AwsProvider {
    client: Client,
    region: String,
    creds: Credentials,
    ec2_endpoint: String,
    autoscaling_endpoint: String,
}

impl AwsProvider {
    pub fn new(region: &str, access_key: &str, secret_key: &str) -> Result<Self> {
        // Without an overall timeout a stalled API call would hang the request forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::Config(format!("http client: {}", e)))?;
        let region = region.trim().to_string();
        if region.is_empty() {
            return Err(ProviderError::Config("empty region".to_string()));
        }
        Ok(Self {
            client,
            ec2_endpoint: format!("https://ec2.{}.amazonaws.com/", region),
            autoscaling_endpoint: format!("https://autoscaling.{}.amazonaws.com/", region),
            region,
            creds: Credentials {
                access_key: access_key.trim().to_string(),
                secret_key: secret_key.trim().to_string(),
            },
        })
    }

    /// Point the client at non-default endpoints (other partitions, local emulators).
    pub fn with_endpoints(mut self, ec2: &str, autoscaling: &str) -> Self {
        self.ec2_endpoint = ec2.to_string();
        self.autoscaling_endpoint = autoscaling.to_string();
        self
    }

    async fn call(
        &self,
        service: Service,
        action: &str,
        params: Vec<(String, String)>,
    ) -> Result<String> {
        let endpoint = match service {
            Service::Ec2 => &self.ec2_endpoint,
            Service::AutoScaling => &self.autoscaling_endpoint,
        };
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| ProviderError::Config(format!("endpoint {}: {}", endpoint, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(port)) => format!("{}:{}", h, port),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(ProviderError::Config(format!(
                    "endpoint {} has no host",
                    endpoint
                )))
            }
        };

        let mut form = vec![
            ("Action".to_string(), action.to_string()),
            ("Version".to_string(), service.version().to_string()),
        ];
        form.extend(params);
        let body = sigv4::form_encode(&form);
        let signed = sigv4::sign_post(
            &self.creds,
            &self.region,
            service.signing_name(),
            &host,
            &body,
            Utc::now(),
        );

        tracing::debug!(action, endpoint = %endpoint, "aws request");
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, sigv4::CONTENT_TYPE)
            .header("x-amz-date", signed.amz_date)
            .header(reqwest::header::AUTHORIZATION, signed.authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if !status.is_success() {
            let err = parse_error(&text).unwrap_or_else(|| ProviderError::Api {
                code: format!("Http{}", status.as_u16()),
                message: text.chars().take(500).collect(),
            });
            tracing::warn!(action, status = status.as_u16(), error = %err, "aws request failed");
            return Err(err);
        }
        Ok(text)
    }
}

fn numbered(prefix: &str, values: &[String]) -> Vec<(String, String)> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("{}.{}", prefix, i + 1), v.clone()))
        .collect()
}

fn param(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

#[async_trait]
impl FleetProvider for AwsProvider {
    async fn list_instances(
        &self,
        tag_key: &str,
        states: &[&str],
    ) -> Result<Vec<DiscoveredInstance>> {
        let mut params = vec![
            param("Filter.1.Name", "tag-key"),
            param("Filter.1.Value.1", tag_key),
            param("Filter.2.Name", "instance-state-name"),
        ];
        let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        params.extend(numbered("Filter.2.Value", &states));
        let xml = self.call(Service::Ec2, "DescribeInstances", params).await?;
        parse_instances(&xml)
    }

    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<DiscoveredInstance>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let xml = self
            .call(Service::Ec2, "DescribeInstances", numbered("InstanceId", instance_ids))
            .await?;
        parse_instances(&xml)
    }

    async fn set_instance_tag(&self, instance_id: &str, key: &str, value: &str) -> Result<()> {
        let params = vec![
            param("ResourceId.1", instance_id),
            param("Tag.1.Key", key),
            param("Tag.1.Value", value),
        ];
        self.call(Service::Ec2, "CreateTags", params).await?;
        Ok(())
    }

    async fn console_output(&self, instance_id: &str) -> Result<Option<String>> {
        let xml = self
            .call(Service::Ec2, "GetConsoleOutput", vec![param("InstanceId", instance_id)])
            .await?;
        parse_console_output(&xml)
    }

    async fn create_launch_configuration(&self, spec: &LaunchConfigurationSpec) -> Result<()> {
        let mut params = vec![
            param("LaunchConfigurationName", &spec.name),
            param("ImageId", &spec.image_id),
            param("InstanceType", &spec.instance_type),
            param("KeyName", &spec.key_name),
            param(
                "UserData",
                base64::engine::general_purpose::STANDARD.encode(spec.user_data.as_bytes()),
            ),
        ];
        params.extend(numbered("SecurityGroups.member", &spec.security_groups));
        self.call(Service::AutoScaling, "CreateLaunchConfiguration", params)
            .await?;
        Ok(())
    }

    async fn delete_launch_configuration(&self, name: &str) -> Result<()> {
        self.call(
            Service::AutoScaling,
            "DeleteLaunchConfiguration",
            vec![param("LaunchConfigurationName", name)],
        )
        .await?;
        Ok(())
    }

    async fn list_launch_configurations(
        &self,
        names: &[String],
    ) -> Result<Vec<LaunchConfiguration>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let xml = self
            .call(
                Service::AutoScaling,
                "DescribeLaunchConfigurations",
                numbered("LaunchConfigurationNames.member", names),
            )
            .await?;
        parse_launch_configurations(&xml)
    }

    async fn create_autoscaling_group(&self, spec: &AutoscalingGroupSpec) -> Result<()> {
        let mut params = vec![
            param("AutoScalingGroupName", &spec.name),
            param("LaunchConfigurationName", &spec.launch_configuration),
            param("MinSize", spec.min_size),
            param("MaxSize", spec.max_size),
            param("DesiredCapacity", spec.desired_capacity),
        ];
        params.extend(numbered("AvailabilityZones.member", &spec.availability_zones));
        for (i, tag) in spec.tags.iter().enumerate() {
            let p = format!("Tags.member.{}", i + 1);
            params.push(param(&format!("{}.Key", p), &tag.key));
            params.push(param(&format!("{}.Value", p), &tag.value));
            params.push(param(&format!("{}.PropagateAtLaunch", p), tag.propagate_at_launch));
            params.push(param(&format!("{}.ResourceId", p), &spec.name));
            params.push(param(&format!("{}.ResourceType", p), "auto-scaling-group"));
        }
        self.call(Service::AutoScaling, "CreateAutoScalingGroup", params)
            .await?;
        Ok(())
    }

    async fn delete_autoscaling_group(&self, name: &str) -> Result<()> {
        self.call(
            Service::AutoScaling,
            "DeleteAutoScalingGroup",
            vec![param("AutoScalingGroupName", name)],
        )
        .await?;
        Ok(())
    }

    async fn list_autoscaling_groups(&self, names: &[String]) -> Result<Vec<AutoscalingGroup>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let xml = self
            .call(
                Service::AutoScaling,
                "DescribeAutoScalingGroups",
                numbered("AutoScalingGroupNames.member", names),
            )
            .await?;
        parse_groups(&xml)
    }

    async fn shutdown_autoscaling_group(&self, name: &str) -> Result<()> {
        let params = vec![
            param("AutoScalingGroupName", name),
            param("MinSize", 0),
            param("MaxSize", 0),
            param("DesiredCapacity", 0),
        ];
        self.call(Service::AutoScaling, "UpdateAutoScalingGroup", params)
            .await?;
        Ok(())
    }

    async fn schedule_capacity_change(
        &self,
        group_name: &str,
        action_name: &str,
        at: DateTime<Utc>,
        capacity: u32,
    ) -> Result<()> {
        let params = vec![
            param("AutoScalingGroupName", group_name),
            param("ScheduledActionName", action_name),
            param("StartTime", at.format("%Y-%m-%dT%H:%M:%SZ")),
            param("MinSize", capacity),
            param("MaxSize", capacity),
            param("DesiredCapacity", capacity),
        ];
        self.call(Service::AutoScaling, "PutScheduledUpdateGroupAction", params)
            .await?;
        Ok(())
    }

    async fn subscribe_termination_notifications(
        &self,
        group_name: &str,
        topic: &str,
    ) -> Result<()> {
        let params = vec![
            param("AutoScalingGroupName", group_name),
            param("TopicARN", topic),
            param("NotificationTypes.member.1", TERMINATE_EVENT),
        ];
        self.call(Service::AutoScaling, "PutNotificationConfiguration", params)
            .await?;
        Ok(())
    }
}

// ============================================================================
// XML decoding
// ============================================================================

type Node<'a, 'i> = roxmltree::Node<'a, 'i>;

fn parse_doc(xml: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse(xml).map_err(|e| ProviderError::Malformed(e.to_string()))
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|c| c.is_element() && c.has_tag_name(name))
}

fn child_text(node: Node, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|c| c.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn child_u32(node: Node, name: &str) -> u32 {
    child_text(node, name)
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}

/// Elements of a list container (`item` in EC2 answers, `member` in Auto Scaling ones).
fn list<'a, 'i>(node: Node<'a, 'i>, container: &str, element: &'static str) -> Vec<Node<'a, 'i>> {
    child(node, container)
        .map(|c| {
            c.children()
                .filter(|n| n.is_element() && n.has_tag_name(element))
                .collect()
        })
        .unwrap_or_default()
}

fn tags(
    node: Node,
    container: &str,
    element: &'static str,
    key: &str,
    value: &str,
) -> HashMap<String, String> {
    list(node, container, element)
        .into_iter()
        .filter_map(|t| Some((child_text(t, key)?, child_text(t, value).unwrap_or_default())))
        .collect()
}

pub(crate) fn parse_error(xml: &str) -> Option<ProviderError> {
    let doc = roxmltree::Document::parse(xml).ok()?;
    let err = doc.descendants().find(|n| n.has_tag_name("Error"))?;
    Some(ProviderError::Api {
        code: child_text(err, "Code")?,
        message: child_text(err, "Message").unwrap_or_default(),
    })
}

pub(crate) fn parse_instances(xml: &str) -> Result<Vec<DiscoveredInstance>> {
    let doc = parse_doc(xml)?;
    let mut out = Vec::new();
    for reservation in list(doc.root_element(), "reservationSet", "item") {
        for inst in list(reservation, "instancesSet", "item") {
            let Some(instance_id) = child_text(inst, "instanceId") else {
                continue;
            };
            let state = child(inst, "instanceState")
                .and_then(|s| child_text(s, "name"))
                .unwrap_or_default();
            let launch_time = child_text(inst, "launchTime")
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc));
            out.push(DiscoveredInstance {
                instance_id,
                state,
                public_host: child_text(inst, "dnsName"),
                launch_time,
                tags: tags(inst, "tagSet", "item", "key", "value"),
            });
        }
    }
    Ok(out)
}

pub(crate) fn parse_groups(xml: &str) -> Result<Vec<AutoscalingGroup>> {
    let doc = parse_doc(xml)?;
    let Some(result) = child(doc.root_element(), "DescribeAutoScalingGroupsResult") else {
        return Err(ProviderError::Malformed(
            "missing DescribeAutoScalingGroupsResult".to_string(),
        ));
    };
    Ok(list(result, "AutoScalingGroups", "member")
        .into_iter()
        .filter_map(|g| {
            Some(AutoscalingGroup {
                name: child_text(g, "AutoScalingGroupName")?,
                launch_configuration: child_text(g, "LaunchConfigurationName"),
                min_size: child_u32(g, "MinSize"),
                max_size: child_u32(g, "MaxSize"),
                desired_capacity: child_u32(g, "DesiredCapacity"),
                instances: list(g, "Instances", "member")
                    .into_iter()
                    .filter_map(|i| {
                        Some(GroupInstance {
                            instance_id: child_text(i, "InstanceId")?,
                            lifecycle_state: child_text(i, "LifecycleState").unwrap_or_default(),
                        })
                    })
                    .collect(),
                tags: tags(g, "Tags", "member", "Key", "Value"),
            })
        })
        .collect())
}

pub(crate) fn parse_launch_configurations(xml: &str) -> Result<Vec<LaunchConfiguration>> {
    let doc = parse_doc(xml)?;
    let Some(result) = child(doc.root_element(), "DescribeLaunchConfigurationsResult") else {
        return Err(ProviderError::Malformed(
            "missing DescribeLaunchConfigurationsResult".to_string(),
        ));
    };
    Ok(list(result, "LaunchConfigurations", "member")
        .into_iter()
        .filter_map(|lc| {
            Some(LaunchConfiguration {
                name: child_text(lc, "LaunchConfigurationName")?,
            })
        })
        .collect())
}

pub(crate) fn parse_console_output(xml: &str) -> Result<Option<String>> {
    let doc = parse_doc(xml)?;
    let Some(encoded) = child_text(doc.root_element(), "output") else {
        return Ok(None);
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.replace(['\n', '\r'], ""))
        .map_err(|e| ProviderError::Malformed(format!("console output: {}", e)))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}
