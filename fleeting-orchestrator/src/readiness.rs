use fleeting_common::naming::ready_tag;
use fleeting_common::{InstanceState, InstanceStatus};
use fleeting_providers::inventory::DiscoveredInstance;
use fleeting_providers::FleetProvider;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::project::Project;

/// Turns "instance running" into "application answering" by GETting the project's ready URL.
pub struct ReadinessProber {
    http: reqwest::Client,
    provider: Arc<dyn FleetProvider>,
}

impl ReadinessProber {
    pub fn new(provider: Arc<dyn FleetProvider>) -> Result<Self, reqwest::Error> {
        // Short timeouts: a probe must never stall a listing.
        let http = reqwest::Client::builder()
            .connect_timeout(StdDuration::from_secs(2))
            .timeout(StdDuration::from_secs(3))
            .build()?;
        Ok(Self { http, provider })
    }

    /// Probe once. On success the ready tag is written so later checks are a tag read.
    ///
    /// Never fails: request errors and non-200 answers come back as `INSTANCE:{state}`
    /// with the reason in `info`.
    pub async fn probe(&self, project: &Project, instance: &DiscoveredInstance) -> InstanceStatus {
        let state = InstanceState::parse(&instance.state);
        let host = match instance.public_host.as_deref() {
            Some(host) if state == InstanceState::Running && !host.is_empty() => host,
            _ => return InstanceStatus::Instance { state, info: None },
        };

        let url = project.ready_url(host);
        let resp = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(
                    project = %project.id,
                    url = %url,
                    error = %e,
                    "ready probe failed"
                );
                return InstanceStatus::Instance {
                    state,
                    info: Some(e.to_string()),
                };
            }
        };
        if resp.status() != reqwest::StatusCode::OK {
            return InstanceStatus::Instance {
                state,
                info: Some(format!("ready check returned HTTP {}", resp.status().as_u16())),
            };
        }

        if let Err(e) = self
            .provider
            .set_instance_tag(&instance.instance_id, &ready_tag(&project.id), &url)
            .await
        {
            tracing::warn!(
                project = %project.id,
                instance_id = %instance.instance_id,
                error = %e,
                "could not record ready tag"
            );
        } else {
            tracing::info!(
                project = %project.id,
                instance_id = %instance.instance_id,
                url = %url,
                "instance ready"
            );
        }
        InstanceStatus::Ready { url }
    }
}

/// Bounded executor for fire-and-forget probes triggered by listings.
///
/// At most one check per instance is queued or running at a time.
#[derive(Clone)]
pub struct ProbeQueue {
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    prober: Arc<ReadinessProber>,
}

/// Releases an instance id from the in-flight set when its task ends, however it ends.
struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
    instance_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.ids).remove(&self.instance_id);
    }
}

fn lock(ids: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProbeQueue {
    pub fn new(prober: Arc<ReadinessProber>, concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            prober,
        }
    }

    pub fn prober(&self) -> &ReadinessProber {
        &self.prober
    }

    /// Schedule a probe; callers may drop the handle.
    ///
    /// Returns `None` when the same instance already has a check pending.
    pub fn dispatch(
        &self,
        project: Project,
        instance: DiscoveredInstance,
    ) -> Option<JoinHandle<InstanceStatus>> {
        if !lock(&self.in_flight).insert(instance.instance_id.clone()) {
            return None;
        }
        let guard = InFlight {
            ids: self.in_flight.clone(),
            instance_id: instance.instance_id.clone(),
        };
        let permits = self.permits.clone();
        let prober = self.prober.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            prober.probe(&project, &instance).await
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleeting_providers::mock::{MockOp, MockProvider};
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn project() -> Project {
        Project::new("openbadges", "# fleeting-meta:ready-url = http://{host}/health\n")
    }

    fn instance(state: &str, host: Option<&str>) -> DiscoveredInstance {
        DiscoveredInstance {
            instance_id: "i-1".into(),
            state: state.into(),
            public_host: host.map(|h| h.to_string()),
            launch_time: None,
            tags: HashMap::from([("fleeting:openbadges".to_string(), "{}".to_string())]),
        }
    }

    fn setup() -> (Arc<MockProvider>, ReadinessProber) {
        let provider = Arc::new(MockProvider::new());
        let prober = ReadinessProber::new(provider.clone()).unwrap();
        (provider, prober)
    }

    #[tokio::test]
    async fn ok_answer_is_ready_and_tags_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let host = server.address().to_string();
        let (provider, prober) = setup();
        let inst = instance("running", Some(&host));
        provider.add_instance(inst.clone());

        let status = prober.probe(&project(), &inst).await;
        let url = format!("http://{}/health", host);
        assert_eq!(status, InstanceStatus::Ready { url: url.clone() });
        assert_eq!(provider.call_count(MockOp::SetInstanceTag), 1);
        assert_eq!(
            provider.instance_tag("i-1", "fleeting:openbadges:ready"),
            Some(url)
        );
    }

    #[tokio::test]
    async fn non_200_reports_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let (provider, prober) = setup();
        let status = prober
            .probe(&project(), &instance("running", Some(&server.address().to_string())))
            .await;
        assert_eq!(status.code(), "INSTANCE:running");
        assert!(status.info().unwrap().contains("503"));
        assert_eq!(provider.call_count(MockOp::SetInstanceTag), 0);
    }

    #[tokio::test]
    async fn network_error_is_captured() {
        // Nothing listens on port 9 locally.
        let (_, prober) = setup();
        let status = prober
            .probe(&project(), &instance("running", Some("127.0.0.1:9")))
            .await;
        assert_eq!(status.code(), "INSTANCE:running");
        assert!(!status.info().unwrap().is_empty());
    }

    #[tokio::test]
    async fn not_running_or_hostless_is_not_probed() {
        let (_, prober) = setup();
        let status = prober.probe(&project(), &instance("pending", Some("h"))).await;
        assert_eq!(
            status,
            InstanceStatus::Instance {
                state: InstanceState::Pending,
                info: None
            }
        );
        let status = prober.probe(&project(), &instance("running", None)).await;
        assert_eq!(status.info(), None);
    }

    #[tokio::test]
    async fn queue_runs_dispatched_probes() {
        let (_, prober) = setup();
        let queue = ProbeQueue::new(Arc::new(prober), 1);
        let mut other = instance("pending", None);
        other.instance_id = "i-2".into();
        let a = queue.dispatch(project(), instance("stopped", None)).unwrap();
        let b = queue.dispatch(project(), other).unwrap();
        assert_eq!(a.await.unwrap().code(), "INSTANCE:stopped");
        assert_eq!(b.await.unwrap().code(), "INSTANCE:pending");
    }

    #[tokio::test]
    async fn queue_keeps_one_pending_check_per_instance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_delay(StdDuration::from_millis(300)))
            .mount(&server)
            .await;
        let (_, prober) = setup();
        let queue = ProbeQueue::new(Arc::new(prober), 2);
        let inst = instance("running", Some(&server.address().to_string()));

        let first = queue.dispatch(project(), inst.clone()).unwrap();
        for _ in 0..9 {
            assert!(queue.dispatch(project(), inst.clone()).is_none());
        }
        assert!(first.await.unwrap().info().unwrap().contains("503"));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);

        // Finished probes release the instance.
        let again = queue.dispatch(project(), inst).unwrap();
        assert_eq!(again.await.unwrap().code(), "INSTANCE:running");
    }
}
