// HTTP glue: project index, health and provider notifications.

mod common;

use axum_test::TestServer;
use common::{group, launch_config, tagged_instance, TEMPLATE};
use fleeting_orchestrator::notifications::NotificationHandler;
use fleeting_orchestrator::routes::{create_router, AppState};
use fleeting_orchestrator::ProjectDirectory;
use fleeting_providers::mock::MockOp;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    server: TestServer,
    fixture: common::Fixture,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("openbadges.sh"), TEMPLATE).unwrap();
    std::fs::write(dir.path().join("webmaker.sh"), "#!/bin/sh\n").unwrap();

    let fixture = common::fixture().await;
    // The router owns its controller; the fixture keeps the provider handle.
    let fleet = common::fixture_controller(&fixture);
    let state = Arc::new(AppState {
        projects: ProjectDirectory::new(dir.path()),
        fleet: Arc::new(fleet),
        notifications: NotificationHandler::new().unwrap(),
    });
    Harness {
        server: TestServer::new(create_router(state)).unwrap(),
        fixture,
        _dir: dir,
    }
}

#[tokio::test]
async fn index_lists_projects_and_health_answers() {
    let h = harness().await;
    let resp = h.server.get("/").await;
    resp.assert_status_ok();
    assert_eq!(
        resp.json::<Vec<String>>(),
        vec!["openbadges".to_string(), "webmaker".to_string()]
    );
    h.server.get("/health").await.assert_text("ok");
}

#[tokio::test]
async fn subscription_confirmation_visits_the_subscribe_url() {
    let h = harness().await;
    let sns = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/confirm"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&sns)
        .await;

    let body = json!({
        "Type": "SubscriptionConfirmation",
        "SubscribeURL": format!("{}/confirm", sns.uri()),
    });
    h.server
        .post("/update")
        .text(body.to_string())
        .await
        .assert_text("subscribed");
}

#[tokio::test]
async fn termination_notification_cleans_up_the_owning_project() {
    let h = harness().await;
    let provider = &h.fixture.provider;
    provider.add_instance(tagged_instance("i-x", "x", "terminated", None));
    provider.add_group(group("x", 0, &[]));
    provider.add_launch_configuration(&launch_config("x"));

    let message = json!({
        "Event": "autoscaling:EC2_INSTANCE_TERMINATE",
        "AutoScalingGroupName": "fleeting_autoscale_openbadges_x",
    });
    let body = json!({ "Type": "Notification", "Message": message.to_string() });
    h.server
        .post("/update")
        .text(body.to_string())
        .await
        .assert_text("updated");

    assert!(provider.group("fleeting_autoscale_openbadges_x").is_none());
    assert!(!provider.has_launch_configuration(&launch_config("x")));
}

#[tokio::test]
async fn unrelated_notifications_are_ignored() {
    let h = harness().await;
    for body in [
        "not json".to_string(),
        json!({ "Type": "UnsubscribeConfirmation" }).to_string(),
        json!({
            "Type": "Notification",
            "Message": json!({ "AutoScalingGroupName": "someone_elses_group" }).to_string(),
        })
        .to_string(),
    ] {
        h.server.post("/update").text(body).await.assert_text("ignored");
    }
    assert_eq!(h.fixture.provider.call_count(MockOp::ListInstances), 0);
}
