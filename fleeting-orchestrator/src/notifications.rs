//! Termination events pushed by the provider's notification service.

use fleeting_common::naming::{slug_from_group_name, GROUP_PREFIX};
use fleeting_common::CleanupReport;
use serde::Deserialize;
use std::time::Duration as StdDuration;

use crate::fleet::{FleetController, FleetError};
use crate::project::ProjectDirectory;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "SubscribeURL")]
    subscribe_url: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AutoscalingEvent {
    #[serde(rename = "AutoScalingGroupName")]
    group_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Subscribed,
    Updated { project: String, report: CleanupReport },
    Ignored,
}

impl NotificationOutcome {
    /// Plain-text reply body.
    pub fn reply(&self) -> &'static str {
        match self {
            NotificationOutcome::Subscribed => "subscribed",
            NotificationOutcome::Updated { .. } => "updated",
            NotificationOutcome::Ignored => "ignored",
        }
    }
}

pub struct NotificationHandler {
    http: reqwest::Client,
}

impl NotificationHandler {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(3))
            .build()?;
        Ok(Self { http })
    }

    pub async fn handle(
        &self,
        body: &str,
        projects: &ProjectDirectory,
        fleet: &FleetController,
    ) -> Result<NotificationOutcome, FleetError> {
        let envelope: Envelope = match serde_json::from_str(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable notification");
                return Ok(NotificationOutcome::Ignored);
            }
        };

        match envelope.kind.as_str() {
            "SubscriptionConfirmation" => {
                let Some(url) = envelope.subscribe_url else {
                    return Ok(NotificationOutcome::Ignored);
                };
                let resp = self.http.get(&url).send().await?;
                tracing::info!(
                    status = resp.status().as_u16(),
                    "notification subscription confirmed"
                );
                Ok(NotificationOutcome::Subscribed)
            }
            "Notification" => {
                let group_name = envelope
                    .message
                    .as_deref()
                    .and_then(|m| serde_json::from_str::<AutoscalingEvent>(m).ok())
                    .and_then(|event| event.group_name);
                let Some(group_name) = group_name else {
                    return Ok(NotificationOutcome::Ignored);
                };
                let ids = projects.ids()?;
                let Some(project_id) = owning_project(&ids, &group_name) else {
                    tracing::debug!(group = %group_name, "notification for a group we do not own");
                    return Ok(NotificationOutcome::Ignored);
                };
                let Some(project) = projects.load(project_id)? else {
                    return Ok(NotificationOutcome::Ignored);
                };
                let report = fleet.cleanup(&project).await;
                tracing::info!(
                    project = %project.id,
                    group = %group_name,
                    deleted = report.deleted,
                    errors = report.errors,
                    "cleanup after termination event"
                );
                Ok(NotificationOutcome::Updated {
                    project: project.id,
                    report,
                })
            }
            _ => Ok(NotificationOutcome::Ignored),
        }
    }
}

/// Project a group belongs to. Project ids may contain `_`, so the longest match wins.
pub fn owning_project<'a>(ids: &'a [String], group_name: &str) -> Option<&'a str> {
    if !group_name.starts_with(GROUP_PREFIX) {
        return None;
    }
    ids.iter()
        .map(|id| id.as_str())
        .filter(|id| slug_from_group_name(id, group_name).is_some())
        .max_by_key(|id| id.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owning_project_prefers_longest_id() {
        let ids = vec!["web".to_string(), "web_api".to_string(), "docs".to_string()];
        assert_eq!(
            owning_project(&ids, "fleeting_autoscale_web_api_bob.main-1"),
            Some("web_api")
        );
        assert_eq!(owning_project(&ids, "fleeting_autoscale_web_bob"), Some("web"));
        assert_eq!(owning_project(&ids, "fleeting_autoscale_other_x"), None);
        assert_eq!(owning_project(&ids, "web_api_x"), None);
    }

    #[test]
    fn replies() {
        assert_eq!(NotificationOutcome::Subscribed.reply(), "subscribed");
        assert_eq!(NotificationOutcome::Ignored.reply(), "ignored");
        assert_eq!(
            NotificationOutcome::Updated {
                project: "p".into(),
                report: CleanupReport::default()
            }
            .reply(),
            "updated"
        );
    }
}
