// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! End-to-end tests of the sample -> status -> notification pipeline.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use corebit_core::notify::NotificationDispatcher;
use corebit_core::probers::{ProbeError, ProbeSample};
use corebit_core::repository::models::{
    AlarmMute, Device, DeviceKind, DeviceNotification, DeviceStatus, HttpMethod, Notification,
};
use corebit_core::repository::{MemoryRepository, Repository};
use corebit_core::status::{StatusEngine, StatusThresholds};

struct Pipeline {
    repo: Arc<MemoryRepository>,
    engine: Arc<StatusEngine>,
    device: Device,
}

async fn pipeline(webhook_url: String) -> Pipeline {
    let repo = Arc::new(MemoryRepository::new());
    let device = repo
        .upsert_device(Device::new(
            "edge-router",
            DeviceKind::GenericPing,
            Some("10.9.9.9".parse().unwrap()),
        ))
        .await
        .unwrap();
    let notification = repo
        .upsert_notification(Notification {
            id: Uuid::new_v4(),
            name: "ops".to_string(),
            url: webhook_url,
            method: HttpMethod::Post,
            message_template: "[Device.Name]: [Status.Old] -> [Status.New]".to_string(),
            enabled: true,
            owner_user_id: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    repo.subscribe_device(DeviceNotification {
        device_id: device.id,
        notification_id: notification.id,
    })
    .await
    .unwrap();

    let engine = Arc::new(StatusEngine::new(
        repo.clone(),
        StatusThresholds::default(),
    ));
    let dispatcher = NotificationDispatcher::new(repo.clone());
    let _intake = dispatcher.start(engine.subscribe());

    Pipeline {
        repo,
        engine,
        device,
    }
}

async fn current(repo: &MemoryRepository, id: Uuid) -> Device {
    repo.get_device(id).await.unwrap()
}

fn network_failure() -> ProbeError {
    ProbeError::Network("no route to host".to_string())
}

async fn wait_for_history(repo: &MemoryRepository, expected: usize) -> usize {
    for _ in 0..100 {
        let len = repo.list_notification_history(100).await.unwrap().len();
        if len >= expected {
            return len;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    repo.list_notification_history(100).await.unwrap().len()
}

/// fail, fail, success, fail, fail, fail from an online start:
/// four transitions, exactly one notification (warning -> offline).
#[tokio::test]
async fn debounced_offline_notifies_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let p = pipeline(server.uri()).await;

    // Bring online first.
    p.engine
        .record_success(&p.device, &ProbeSample::reachable())
        .await
        .unwrap();

    for step in ["fail", "fail", "success", "fail", "fail", "fail"] {
        let device = current(&p.repo, p.device.id).await;
        if step == "success" {
            p.engine
                .record_success(&device, &ProbeSample::reachable())
                .await
                .unwrap();
        } else {
            p.engine
                .record_failure(&device, &network_failure())
                .await
                .unwrap();
        }
    }

    // Final state: offline after the third consecutive failure.
    assert_eq!(
        current(&p.repo, p.device.id).await.status,
        DeviceStatus::Offline
    );

    // Event log shows the expected transition chain.
    let events = p
        .repo
        .list_status_events_until(p.device.id, Utc::now())
        .await
        .unwrap();
    let transitions: Vec<(DeviceStatus, DeviceStatus)> = events
        .iter()
        .map(|e| (e.previous_status, e.new_status))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (DeviceStatus::Unknown, DeviceStatus::Online),
            (DeviceStatus::Online, DeviceStatus::Warning),
            (DeviceStatus::Warning, DeviceStatus::Online),
            (DeviceStatus::Online, DeviceStatus::Warning),
            (DeviceStatus::Warning, DeviceStatus::Offline),
        ]
    );

    // Exactly one delivery: the warning -> offline edge.
    let history_len = wait_for_history(&p.repo, 1).await;
    assert_eq!(history_len, 1);
    let history = p.repo.list_notification_history(10).await.unwrap();
    assert!(history[0].success);
    assert_eq!(history[0].message, "edge-router: warning -> offline");

    // Give the mock a moment, then verify no extra requests arrived.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.verify().await;
}

/// An active global mute suppresses delivery and history, but the status
/// event is still recorded.
#[tokio::test]
async fn global_mute_suppresses_delivery_but_not_events() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let p = pipeline(server.uri()).await;
    p.repo
        .create_alarm_mute(AlarmMute {
            id: Uuid::new_v4(),
            user_id: None,
            muted_by: "admin".to_string(),
            mute_until: Some(Utc::now() + chrono::Duration::hours(1)),
            reason: Some("maintenance window".to_string()),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    p.engine
        .record_success(&p.device, &ProbeSample::reachable())
        .await
        .unwrap();
    for _ in 0..3 {
        let device = current(&p.repo, p.device.id).await;
        p.engine
            .record_failure(&device, &network_failure())
            .await
            .unwrap();
    }

    // The offline event exists...
    let events = p
        .repo
        .list_status_events_until(p.device.id, Utc::now())
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.new_status == DeviceStatus::Offline));

    // ...but no delivery and no history row ever appear.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(p
        .repo
        .list_notification_history(10)
        .await
        .unwrap()
        .is_empty());
    server.verify().await;
}

/// Recovery notifies again: offline -> online is an offline edge.
#[tokio::test]
async fn recovery_from_offline_notifies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let p = pipeline(server.uri()).await;
    p.engine
        .record_success(&p.device, &ProbeSample::reachable())
        .await
        .unwrap();
    for _ in 0..3 {
        let device = current(&p.repo, p.device.id).await;
        p.engine
            .record_failure(&device, &network_failure())
            .await
            .unwrap();
    }
    let device = current(&p.repo, p.device.id).await;
    p.engine
        .record_success(&device, &ProbeSample::reachable())
        .await
        .unwrap();

    let history_len = wait_for_history(&p.repo, 2).await;
    assert_eq!(history_len, 2);
    server.verify().await;
}
