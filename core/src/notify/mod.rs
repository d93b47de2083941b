// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Notification dispatcher.
//!
//! Consumes status changes and turns them into webhook deliveries:
//!
//! 1. resolve subscriptions (per-device links plus on-duty users' targets),
//! 2. drop everything under an active mute,
//! 3. render the message template,
//! 4. deliver over HTTP with retry (5xx and network errors retry with
//!    exponential backoff; 4xx is permanent),
//! 5. record a history row on settle.
//!
//! Per-device mailboxes keep deliveries for one device ordered by event
//! time while different devices proceed independently. Offline-edge
//! transitions always dispatch; pure warning transitions only when the
//! `warning_notifications` setting is enabled.

pub mod shifts;
pub mod template;

pub use shifts::{current_shift, on_duty_users, ShiftKind};
pub use template::render;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::repository::models::{
    DeviceStatus, HttpMethod, Notification, NotificationHistory,
};
use crate::repository::Repository;
use crate::status::StatusChange;

/// Setting key enabling warning-transition notifications
pub const WARNING_NOTIFICATIONS_SETTING: &str = "warning_notifications";

/// Maximum delivery attempts (one initial plus retries)
const MAX_ATTEMPTS: u32 = 4;

/// First retry backoff; doubles per retry (1 s, 2 s, 4 s)
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Per-device mailbox depth
const MAILBOX_CAPACITY: usize = 64;

/// Notification dispatcher
pub struct NotificationDispatcher {
    repo: Arc<dyn Repository>,
    client: reqwest::Client,
    mailboxes: DashMap<Uuid, mpsc::Sender<StatusChange>>,
}

impl NotificationDispatcher {
    pub fn new(repo: Arc<dyn Repository>) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            repo,
            client,
            mailboxes: DashMap::new(),
        })
    }

    /// Consume a status-change stream until it closes.
    pub fn start(self: &Arc<Self>, mut changes: broadcast::Receiver<StatusChange>) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => dispatcher.accept(change).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "notification intake lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Route one change into its device's mailbox, creating the worker on
    /// first use.
    pub async fn accept(self: &Arc<Self>, change: StatusChange) {
        if !self.should_dispatch(&change).await {
            return;
        }
        let device_id = change.device.id;
        let sender = self
            .mailboxes
            .entry(device_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
                let dispatcher = self.clone();
                tokio::spawn(dispatcher.drain_mailbox(rx));
                tx
            })
            .clone();
        if sender.send(change).await.is_err() {
            self.mailboxes.remove(&device_id);
        }
    }

    /// Offline edges always dispatch; warning-only transitions are opt-in.
    async fn should_dispatch(&self, change: &StatusChange) -> bool {
        let event = &change.event;
        if event.new_status == DeviceStatus::Offline
            || event.previous_status == DeviceStatus::Offline
        {
            return true;
        }
        if event.new_status == DeviceStatus::Warning {
            return matches!(
                self.repo
                    .get_setting(WARNING_NOTIFICATIONS_SETTING)
                    .await
                    .ok()
                    .flatten()
                    .as_deref(),
                Some("true") | Some("1")
            );
        }
        false
    }

    /// Per-device worker: one delivery pipeline at a time, in order.
    async fn drain_mailbox(self: Arc<Self>, mut rx: mpsc::Receiver<StatusChange>) {
        while let Some(change) = rx.recv().await {
            self.dispatch(change).await;
        }
    }

    /// Resolve, mute-filter, render, deliver, record.
    async fn dispatch(&self, change: StatusChange) {
        let now = Utc::now();
        let device = &change.device;

        let mutes = match self.repo.list_alarm_mutes(now).await {
            Ok(mutes) => mutes,
            Err(e) => {
                error!(error = %e, "failed to load alarm mutes");
                return;
            }
        };
        if mutes.iter().any(|m| m.user_id.is_none()) {
            debug!(device = %device.name, "global mute active, suppressing notifications");
            return;
        }
        let muted_users: Vec<Uuid> = mutes.iter().filter_map(|m| m.user_id).collect();

        let targets = match self.resolve_targets(&change).await {
            Ok(targets) => targets,
            Err(e) => {
                error!(error = %e, "failed to resolve notification targets");
                return;
            }
        };

        for notification in targets {
            if let Some(owner) = notification.owner_user_id {
                if muted_users.contains(&owner) {
                    debug!(
                        notification = %notification.name,
                        "owner muted, skipping delivery"
                    );
                    continue;
                }
            }

            let message = template::render(&notification.message_template, device, &change.event);
            let (success, status_code, attempts) = self.deliver(&notification, &message).await;
            let history = NotificationHistory {
                id: Uuid::new_v4(),
                notification_id: notification.id,
                device_id: device.id,
                event_id: change.event.id,
                message,
                success,
                status_code,
                attempts,
                created_at: Utc::now(),
            };
            if let Err(e) = self.repo.append_notification_history(history).await {
                error!(error = %e, "failed to record notification history");
            }
        }
    }

    /// Global subscriptions plus the on-duty users' notifications.
    async fn resolve_targets(
        &self,
        change: &StatusChange,
    ) -> Result<Vec<Notification>, crate::repository::RepositoryError> {
        let mut targets = self
            .repo
            .list_device_subscriptions(change.device.id)
            .await?;

        if change.device.use_on_duty {
            if let Some(config) = self.repo.get_on_duty_config().await? {
                let users = shifts::on_duty_users(&config, Utc::now());
                if !users.is_empty() {
                    for notification in self.repo.list_notifications().await? {
                        if notification
                            .owner_user_id
                            .map_or(false, |owner| users.contains(&owner))
                        {
                            targets.push(notification);
                        }
                    }
                }
            }
        }

        targets.retain(|n| n.enabled);
        targets.sort_by_key(|n| n.id);
        targets.dedup_by_key(|n| n.id);
        Ok(targets)
    }

    /// HTTP delivery with retry. Returns (success, last status, attempts).
    async fn deliver(
        &self,
        notification: &Notification,
        message: &str,
    ) -> (bool, Option<u16>, u32) {
        let mut attempts = 0;
        let mut last_status = None;
        while attempts < MAX_ATTEMPTS {
            if attempts > 0 {
                let backoff = BASE_BACKOFF * 2u32.pow(attempts - 1);
                debug!(notification = %notification.name, ?backoff, "retrying delivery");
                tokio::time::sleep(backoff).await;
            }
            attempts += 1;

            let request = match notification.method {
                HttpMethod::Get => {
                    let url = format!("{}{}", notification.url, template::url_encode(message));
                    self.client.get(url)
                }
                HttpMethod::Post => self
                    .client
                    .post(&notification.url)
                    .header("Content-Type", "text/plain")
                    .body(message.to_string()),
            };

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    last_status = Some(status.as_u16());
                    if status.is_success() {
                        return (true, last_status, attempts);
                    }
                    if status.is_client_error() {
                        warn!(
                            notification = %notification.name,
                            status = status.as_u16(),
                            "permanent delivery failure"
                        );
                        return (false, last_status, attempts);
                    }
                    // 5xx: retry.
                }
                Err(e) => {
                    debug!(notification = %notification.name, error = %e, "delivery attempt failed");
                }
            }
        }
        (false, last_status, attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::models::*;
    use crate::repository::MemoryRepository;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(url: String, method_kind: HttpMethod) -> (Arc<MemoryRepository>, Arc<NotificationDispatcher>, Device, Notification) {
        let repo = Arc::new(MemoryRepository::new());
        let device = repo
            .upsert_device(Device::new(
                "edge",
                DeviceKind::GenericPing,
                Some("10.1.1.1".parse().unwrap()),
            ))
            .await
            .unwrap();
        let notification = repo
            .upsert_notification(Notification {
                id: Uuid::new_v4(),
                name: "ops-hook".to_string(),
                url,
                method: method_kind,
                message_template: "[Device.Name] went [Status.New]".to_string(),
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

        let dispatcher = NotificationDispatcher::new(repo.clone());
        (repo, dispatcher, device, notification)
    }

    fn offline_change(device: &Device) -> StatusChange {
        StatusChange {
            device: device.clone(),
            event: DeviceStatusEvent {
                id: Uuid::new_v4(),
                device_id: device.id,
                previous_status: DeviceStatus::Warning,
                new_status: DeviceStatus::Offline,
                created_at: Utc::now(),
                message: None,
            },
        }
    }

    #[tokio::test]
    async fn test_post_delivery_and_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_string_contains("edge went offline"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (repo, dispatcher, device, _) =
            setup(format!("{}/hook", server.uri()), HttpMethod::Post).await;
        dispatcher.dispatch(offline_change(&device)).await;

        let history = repo.list_notification_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].attempts, 1);
        assert_eq!(history[0].status_code, Some(200));
    }

    #[tokio::test]
    async fn test_get_appends_encoded_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (repo, dispatcher, device, _) = setup(
            format!("{}/send?text=", server.uri()),
            HttpMethod::Get,
        )
        .await;
        dispatcher.dispatch(offline_change(&device)).await;

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let query = received[0].url.query().unwrap();
        assert!(query.contains("text=edge%20went%20offline"), "query was {query}");

        let history = repo.list_notification_history(10).await.unwrap();
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn test_4xx_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .expect(1)
            .mount(&server)
            .await;

        let (repo, dispatcher, device, _) = setup(server.uri(), HttpMethod::Post).await;
        dispatcher.dispatch(offline_change(&device)).await;

        let history = repo.list_notification_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].attempts, 1);
        assert_eq!(history[0].status_code, Some(410));
    }

    #[tokio::test(start_paused = true)]
    async fn test_5xx_retries_with_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&server)
            .await;

        let (repo, dispatcher, device, _) = setup(server.uri(), HttpMethod::Post).await;
        dispatcher.dispatch(offline_change(&device)).await;

        let history = repo.list_notification_history(10).await.unwrap();
        assert!(!history[0].success);
        assert_eq!(history[0].attempts, 4);
    }

    #[tokio::test]
    async fn test_global_mute_suppresses_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (repo, dispatcher, device, _) = setup(server.uri(), HttpMethod::Post).await;
        repo.create_alarm_mute(AlarmMute {
            id: Uuid::new_v4(),
            user_id: None,
            muted_by: "admin".to_string(),
            mute_until: Some(Utc::now() + chrono::Duration::hours(1)),
            reason: Some("maintenance".to_string()),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        dispatcher.dispatch(offline_change(&device)).await;

        // Event suppressed entirely: no history row, no HTTP call.
        assert!(repo.list_notification_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_mute_filters_owned_notifications() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (repo, dispatcher, device, _) = setup(server.uri(), HttpMethod::Post).await;

        // A second, owned notification whose owner is muted.
        let muted_user = Uuid::new_v4();
        let owned = repo
            .upsert_notification(Notification {
                id: Uuid::new_v4(),
                name: "owned-hook".to_string(),
                url: server.uri(),
                method: HttpMethod::Post,
                message_template: "x".to_string(),
                enabled: true,
                owner_user_id: Some(muted_user),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        repo.subscribe_device(DeviceNotification {
            device_id: device.id,
            notification_id: owned.id,
        })
        .await
        .unwrap();
        repo.create_alarm_mute(AlarmMute {
            id: Uuid::new_v4(),
            user_id: Some(muted_user),
            muted_by: "admin".to_string(),
            mute_until: None,
            reason: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        dispatcher.dispatch(offline_change(&device)).await;

        let history = repo.list_notification_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_warning_transitions_follow_setting() {
        let server = MockServer::start().await;
        let (repo, dispatcher, device, _) = setup(server.uri(), HttpMethod::Post).await;

        let warning = StatusChange {
            device: device.clone(),
            event: DeviceStatusEvent {
                id: Uuid::new_v4(),
                device_id: device.id,
                previous_status: DeviceStatus::Online,
                new_status: DeviceStatus::Warning,
                created_at: Utc::now(),
                message: None,
            },
        };

        // Default off.
        assert!(!dispatcher.should_dispatch(&warning).await);

        repo.set_setting(WARNING_NOTIFICATIONS_SETTING, "true").await.unwrap();
        assert!(dispatcher.should_dispatch(&warning).await);

        // Offline edges dispatch regardless.
        assert!(dispatcher.should_dispatch(&offline_change(&device)).await);
    }

    #[tokio::test]
    async fn test_on_duty_resolution_adds_owned_targets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let (repo, dispatcher, mut device, _) = setup(server.uri(), HttpMethod::Post).await;
        device.use_on_duty = true;
        let device = repo.upsert_device(device).await.unwrap();

        let on_duty_user = Uuid::new_v4();
        repo.upsert_notification(Notification {
            id: Uuid::new_v4(),
            name: "duty-hook".to_string(),
            url: server.uri(),
            method: HttpMethod::Post,
            message_template: "[Device.Name]".to_string(),
            enabled: true,
            owner_user_id: Some(on_duty_user),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        // Both shifts cover the whole day with the same user; whichever is
        // current resolves to them.
        let all_day = Shift {
            start_time: chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            end_time: chrono::NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            timezone: "UTC".to_string(),
            user_ids: vec![on_duty_user],
        };
        let all_night = Shift {
            start_time: chrono::NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            end_time: chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            timezone: "UTC".to_string(),
            user_ids: vec![on_duty_user],
        };
        repo.set_on_duty_config(OnDutyConfig {
            day: all_day,
            night: all_night,
        })
        .await
        .unwrap();

        dispatcher.dispatch(offline_change(&device)).await;

        let history = repo.list_notification_history(10).await.unwrap();
        assert_eq!(history.len(), 2);
    }
}
