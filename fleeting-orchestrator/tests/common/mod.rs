// Shared fixtures: a mock provider, a manual clock and a stand-in code host.
#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use fleeting_common::InstanceRecord;
use fleeting_orchestrator::temp_cache::{ManualClock, MemoryTempCache};
use fleeting_orchestrator::{FleetConfig, FleetController, Project};
use fleeting_providers::inventory::{AutoscalingGroup, DiscoveredInstance, GroupInstance};
use fleeting_providers::mock::MockProvider;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const PROJECT: &str = "openbadges";
pub const CACHE_TTL: Duration = Duration::from_secs(60);

pub const TEMPLATE: &str = "#!/bin/sh\n\
# fleeting-meta:name = Open Badges Backpack\n\
# fleeting-meta:repo = mozilla/openbadges\n\
# fleeting-meta:image-id = ami-5ef72d37\n\
# fleeting-meta:ready-url = http://{host}/\n\
git clone https://github.com/{{git_user}}/openbadges.git -b {{git_branch}}\n\
echo {{project}}/{{slug}} > /etc/motd\n\
export PERSONA_URL={{persona_url}}\n";

pub struct Fixture {
    pub provider: Arc<MockProvider>,
    pub clock: Arc<ManualClock>,
    pub cache: Arc<MemoryTempCache>,
    pub fleet: FleetController,
    pub project: Project,
    pub git: MockServer,
}

fn config(git: &MockServer) -> FleetConfig {
    FleetConfig {
        git_base_url: git.uri(),
        default_instance_type: "t1.micro".to_string(),
        availability_zones: vec!["us-east-1a".to_string()],
        build_vars: BTreeMap::from([(
            "persona_url".to_string(),
            "https://login.example.org".to_string(),
        )]),
        probe_concurrency: 2,
    }
}

/// A second controller over the same provider, cache and code host.
pub fn fixture_controller(f: &Fixture) -> FleetController {
    FleetController::new(f.provider.clone(), f.cache.clone(), config(&f.git)).unwrap()
}

pub async fn fixture() -> Fixture {
    let git = MockServer::start().await;
    let provider = Arc::new(MockProvider::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    ));
    let cache = Arc::new(MemoryTempCache::with_clock(CACHE_TTL, clock.clone()));
    let fleet = FleetController::new(provider.clone(), cache.clone(), config(&git)).unwrap();
    Fixture {
        provider,
        clock,
        cache,
        fleet,
        project: Project::new(PROJECT, TEMPLATE),
        git,
    }
}

/// Answer HEAD `/{user}/openbadges/tree/{branch}` on the stand-in code host.
pub async fn git_branch(server: &MockServer, user: &str, branch: &str, status: u16) {
    Mock::given(method("HEAD"))
        .and(path(format!("/{}/openbadges/tree/{}", user, branch)))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

pub fn tagged_instance(
    id: &str,
    slug: &str,
    state: &str,
    host: Option<&str>,
) -> DiscoveredInstance {
    let record = InstanceRecord::pending(slug, "bob", "main", Some(3600));
    DiscoveredInstance {
        instance_id: id.to_string(),
        state: state.to_string(),
        public_host: host.map(|h| h.to_string()),
        launch_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap()),
        tags: HashMap::from([(format!("fleeting:{}", PROJECT), record.encode())]),
    }
}

pub fn group(slug: &str, min_size: u32, instance_ids: &[&str]) -> AutoscalingGroup {
    AutoscalingGroup {
        name: format!("fleeting_autoscale_{}_{}", PROJECT, slug),
        launch_configuration: Some(format!("fleeting_launchconfig_{}_{}", PROJECT, slug)),
        min_size,
        max_size: min_size,
        desired_capacity: min_size,
        instances: instance_ids
            .iter()
            .map(|id| GroupInstance {
                instance_id: id.to_string(),
                lifecycle_state: "InService".to_string(),
            })
            .collect(),
        tags: HashMap::new(),
    }
}

pub fn launch_config(slug: &str) -> String {
    format!("fleeting_launchconfig_{}_{}", PROJECT, slug)
}
