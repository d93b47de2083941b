// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Realtime map-sync bus.
//!
//! One WebSocket endpoint; clients identify themselves and subscribe to
//! maps. Topology mutations publish a `map:change` that fans out to every
//! subscriber of that map except the originator. A slow socket that
//! overruns the broadcast buffer drops the oldest messages and receives a
//! `lag` event.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Broadcast buffer; overrun produces `lag` events rather than unbounded
/// memory growth.
const BUS_CAPACITY: usize = 512;

/// What part of the topology changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Placement,
    Connection,
    Map,
}

/// What happened to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// One topology mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapChange {
    #[serde(rename = "mapId")]
    pub map_id: Uuid,
    #[serde(rename = "changeType")]
    pub change_type: ChangeType,
    pub action: ChangeAction,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Originating user; their own sockets do not receive the echo.
    #[serde(rename = "userId")]
    pub user_id: Option<Uuid>,
}

/// Messages sent to clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "map:change")]
    MapChange {
        #[serde(flatten)]
        change: MapChange,
    },
    #[serde(rename = "lag")]
    Lag { missed: u64 },
}

/// Messages accepted from clients
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Identify {
        #[serde(rename = "userId")]
        user_id: Uuid,
    },
    Subscribe {
        #[serde(rename = "mapId")]
        map_id: Uuid,
    },
    Unsubscribe {
        #[serde(rename = "mapId")]
        map_id: Uuid,
    },
}

/// Map-sync hub
pub struct RealtimeHub {
    tx: broadcast::Sender<MapChange>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish a topology mutation to all subscribers.
    pub fn publish(&self, change: MapChange) {
        debug!(map_id = %change.map_id, "publishing map change");
        let _ = self.tx.send(change);
    }

    /// Number of connected receivers (tests and diagnostics).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Drive one accepted WebSocket until it closes.
    pub async fn run_socket(&self, socket: WebSocket) {
        info!("websocket client connected");
        let (mut sink, mut stream) = socket.split();
        let mut bus = self.tx.subscribe();
        let mut state = SocketState::default();

        loop {
            tokio::select! {
                published = bus.recv() => {
                    let outgoing = match published {
                        Ok(change) => {
                            if !state.wants(&change) {
                                continue;
                            }
                            ServerMessage::MapChange { change }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "websocket client lagging, dropped oldest messages");
                            ServerMessage::Lag { missed }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    let Ok(text) = serde_json::to_string(&outgoing) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ClientMessage>(&text) {
                                Ok(message) => state.apply(message),
                                Err(e) => debug!(error = %e, "ignoring unparseable client message"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "websocket read error");
                            break;
                        }
                    }
                }
            }
        }
        info!("websocket client disconnected");
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection subscription state
#[derive(Debug, Default)]
struct SocketState {
    user_id: Option<Uuid>,
    subscriptions: HashSet<Uuid>,
}

impl SocketState {
    fn apply(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Identify { user_id } => self.user_id = Some(user_id),
            ClientMessage::Subscribe { map_id } => {
                self.subscriptions.insert(map_id);
            }
            ClientMessage::Unsubscribe { map_id } => {
                self.subscriptions.remove(&map_id);
            }
        }
    }

    /// Subscribed to the map, and not the originator.
    fn wants(&self, change: &MapChange) -> bool {
        if !self.subscriptions.contains(&change.map_id) {
            return false;
        }
        match (self.user_id, change.user_id) {
            (Some(me), Some(origin)) => me != origin,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn change(map_id: Uuid, user_id: Option<Uuid>) -> MapChange {
        MapChange {
            map_id,
            change_type: ChangeType::Placement,
            action: ChangeAction::Update,
            timestamp: Utc::now(),
            user_id,
        }
    }

    #[test]
    fn test_subscription_filtering() {
        let map = Uuid::new_v4();
        let other_map = Uuid::new_v4();
        let mut state = SocketState::default();

        assert!(!state.wants(&change(map, None)));

        state.apply(ClientMessage::Subscribe { map_id: map });
        assert!(state.wants(&change(map, None)));
        assert!(!state.wants(&change(other_map, None)));

        state.apply(ClientMessage::Unsubscribe { map_id: map });
        assert!(!state.wants(&change(map, None)));
    }

    #[test]
    fn test_originator_excluded() {
        let map = Uuid::new_v4();
        let me = Uuid::new_v4();
        let someone_else = Uuid::new_v4();
        let mut state = SocketState::default();
        state.apply(ClientMessage::Subscribe { map_id: map });

        // Unidentified sockets get everything on the map.
        assert!(state.wants(&change(map, Some(me))));

        state.apply(ClientMessage::Identify { user_id: me });
        assert!(!state.wants(&change(map, Some(me))));
        assert!(state.wants(&change(map, Some(someone_else))));
        assert!(state.wants(&change(map, None)));
    }

    #[test]
    fn test_wire_format() {
        let map = Uuid::new_v4();
        let user = Uuid::new_v4();
        let message = ServerMessage::MapChange {
            change: change(map, Some(user)),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "map:change");
        assert_eq!(value["mapId"], map.to_string());
        assert_eq!(value["changeType"], "placement");
        assert_eq!(value["action"], "update");
        assert_eq!(value["userId"], user.to_string());

        let lag = serde_json::to_value(&ServerMessage::Lag { missed: 3 }).unwrap();
        assert_eq!(lag["type"], "lag");
        assert_eq!(lag["missed"], 3);
    }

    #[test]
    fn test_client_message_parsing() {
        let map = Uuid::new_v4();
        let parsed: ClientMessage =
            serde_json::from_str(&format!("{{\"type\":\"subscribe\",\"mapId\":\"{map}\"}}"))
                .unwrap();
        assert!(matches!(parsed, ClientMessage::Subscribe { map_id } if map_id == map));

        let user = Uuid::new_v4();
        let parsed: ClientMessage =
            serde_json::from_str(&format!("{{\"type\":\"identify\",\"userId\":\"{user}\"}}"))
                .unwrap();
        assert!(matches!(parsed, ClientMessage::Identify { user_id } if user_id == user));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let hub = RealtimeHub::new();
        hub.publish(change(Uuid::new_v4(), None));
        assert_eq!(hub.receiver_count(), 0);
    }
}
