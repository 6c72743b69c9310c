//! Push-channel fan-out for processing progress.
//!
//! Clients hold a long-lived channel keyed by a caller-supplied client id
//! and subscribe per application. Broadcasts serialize per channel (each
//! channel is a single mpsc sender), not globally. A failed send means the
//! receiver is gone; the channel is evicted on the spot.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ErrorCode;
use crate::models::ProcessingStage;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    ConnectionEstablished {
        client_id: String,
        timestamp: DateTime<Utc>,
    },
    SubscriptionConfirmed {
        application_id: Uuid,
    },
    ProcessingUpdate {
        application_id: Uuid,
        stage: String,
        status: String,
        progress: u8,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    ProcessingComplete {
        application_id: Uuid,
        result: serde_json::Value,
    },
    ProcessingError {
        application_id: Uuid,
        error_code: ErrorCode,
        message: String,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelMeta {
    pub connected_at: DateTime<Utc>,
    pub user: Option<String>,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushStats {
    pub connections: usize,
    pub subscriptions: usize,
    pub clients: Vec<ClientInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub connected_at: DateTime<Utc>,
    pub user: Option<String>,
    pub origin: Option<String>,
    pub subscription_count: usize,
}

struct ClientChannel {
    tx: mpsc::UnboundedSender<PushMessage>,
    meta: ChannelMeta,
    subscriptions: HashSet<Uuid>,
}

#[derive(Default)]
struct HubInner {
    channels: HashMap<String, ClientChannel>,
    subscribers: HashMap<Uuid, HashSet<String>>,
}

pub struct PushHub {
    clock: Arc<dyn Clock>,
    inner: Mutex<HubInner>,
}

impl PushHub {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(HubInner::default()),
        }
    }

    /// Register a client channel. Reconnecting with the same client id
    /// replaces the previous channel.
    pub fn connect(
        &self,
        client_id: &str,
        user: Option<String>,
        origin: Option<String>,
    ) -> mpsc::UnboundedReceiver<PushMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let meta = ChannelMeta {
            connected_at: self.clock.now(),
            user,
            origin,
        };
        let hello = PushMessage::ConnectionEstablished {
            client_id: client_id.to_string(),
            timestamp: meta.connected_at,
        };
        let _ = tx.send(hello);

        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if inner.channels.contains_key(client_id) {
            Self::drop_client(&mut inner, client_id);
        }
        inner.channels.insert(
            client_id.to_string(),
            ClientChannel {
                tx,
                meta,
                subscriptions: HashSet::new(),
            },
        );
        tracing::info!(client_id, "push channel connected");
        rx
    }

    /// Like [`Self::connect`], surfaced as a `Stream` for transport glue
    /// that forwards messages to a socket.
    pub fn connect_stream(
        &self,
        client_id: &str,
        user: Option<String>,
        origin: Option<String>,
    ) -> tokio_stream::wrappers::UnboundedReceiverStream<PushMessage> {
        tokio_stream::wrappers::UnboundedReceiverStream::new(self.connect(client_id, user, origin))
    }

    pub fn disconnect(&self, client_id: &str) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        Self::drop_client(&mut inner, client_id);
        tracing::info!(client_id, "push channel disconnected");
    }

    fn drop_client(inner: &mut HubInner, client_id: &str) {
        if let Some(channel) = inner.channels.remove(client_id) {
            for application_id in channel.subscriptions {
                if let Some(subs) = inner.subscribers.get_mut(&application_id) {
                    subs.remove(client_id);
                    if subs.is_empty() {
                        inner.subscribers.remove(&application_id);
                    }
                }
            }
        }
    }

    /// Subscribe a connected client to one application's updates.
    pub fn subscribe(&self, client_id: &str, application_id: Uuid) -> bool {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let Some(channel) = inner.channels.get_mut(client_id) else {
            return false;
        };
        channel.subscriptions.insert(application_id);
        let confirmed = channel
            .tx
            .send(PushMessage::SubscriptionConfirmed { application_id })
            .is_ok();
        inner
            .subscribers
            .entry(application_id)
            .or_default()
            .insert(client_id.to_string());
        tracing::debug!(client_id, application_id = %application_id, "subscribed");
        confirmed
    }

    pub fn unsubscribe(&self, client_id: &str, application_id: Uuid) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(channel) = inner.channels.get_mut(client_id) {
            channel.subscriptions.remove(&application_id);
        }
        if let Some(subs) = inner.subscribers.get_mut(&application_id) {
            subs.remove(client_id);
            if subs.is_empty() {
                inner.subscribers.remove(&application_id);
            }
        }
    }

    /// Deliver to every subscriber of an application, evicting channels
    /// whose receiver is gone.
    pub fn send_to_application(&self, application_id: Uuid, message: PushMessage) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let Some(subscriber_ids) = inner.subscribers.get(&application_id) else {
            return;
        };
        let targets: Vec<String> = subscriber_ids.iter().cloned().collect();
        let mut dead = Vec::new();
        for client_id in targets {
            if let Some(channel) = inner.channels.get(&client_id) {
                if channel.tx.send(message.clone()).is_err() {
                    dead.push(client_id);
                }
            }
        }
        for client_id in dead {
            tracing::warn!(client_id, "push channel dead, evicting");
            Self::drop_client(&mut inner, &client_id);
        }
    }

    pub fn send_processing_update(
        &self,
        application_id: Uuid,
        stage: ProcessingStage,
        status: &str,
        progress: u8,
        message: &str,
        details: Option<serde_json::Value>,
    ) {
        self.send_to_application(
            application_id,
            PushMessage::ProcessingUpdate {
                application_id,
                stage: stage.to_string(),
                status: status.to_string(),
                progress,
                message: message.to_string(),
                details,
            },
        );
    }

    pub fn send_complete(&self, application_id: Uuid, result: serde_json::Value) {
        self.send_to_application(
            application_id,
            PushMessage::ProcessingComplete {
                application_id,
                result,
            },
        );
    }

    pub fn send_error(&self, application_id: Uuid, error_code: ErrorCode, message: &str) {
        self.send_to_application(
            application_id,
            PushMessage::ProcessingError {
                application_id,
                error_code,
                message: message.to_string(),
            },
        );
    }

    /// Keep-alive broadcast to every channel.
    pub fn ping_all(&self) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let dead: Vec<String> = inner
            .channels
            .iter()
            .filter(|(_, c)| c.tx.send(PushMessage::Ping).is_err())
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in dead {
            Self::drop_client(&mut inner, &client_id);
        }
    }

    pub fn stats(&self) -> PushStats {
        let inner = self.inner.lock().expect("hub lock poisoned");
        PushStats {
            connections: inner.channels.len(),
            subscriptions: inner.subscribers.values().map(|s| s.len()).sum(),
            clients: inner
                .channels
                .iter()
                .map(|(id, c)| ClientInfo {
                    client_id: id.clone(),
                    connected_at: c.meta.connected_at,
                    user: c.meta.user.clone(),
                    origin: c.meta.origin.clone(),
                    subscription_count: c.subscriptions.len(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn hub() -> PushHub {
        PushHub::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn connect_subscribe_and_receive() {
        let hub = hub();
        let app = Uuid::new_v4();
        let mut rx = hub.connect("client-1", None, Some("127.0.0.1".into()));
        assert!(hub.subscribe("client-1", app));

        hub.send_processing_update(app, ProcessingStage::Ingest, "in_progress", 10, "saving", None);

        assert!(matches!(
            rx.recv().await.unwrap(),
            PushMessage::ConnectionEstablished { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            PushMessage::SubscriptionConfirmed { application_id } if application_id == app
        ));
        match rx.recv().await.unwrap() {
            PushMessage::ProcessingUpdate { progress, stage, .. } => {
                assert_eq!(progress, 10);
                assert_eq!(stage, "ingest");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribed_clients_get_nothing() {
        let hub = hub();
        let app = Uuid::new_v4();
        let mut rx = hub.connect("client-1", None, None);
        let _ = rx.recv().await; // connection_established

        hub.send_complete(app, serde_json::json!({"status": "verified"}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_channels_are_evicted_on_send() {
        let hub = hub();
        let app = Uuid::new_v4();
        let rx = hub.connect("client-1", None, None);
        hub.subscribe("client-1", app);
        drop(rx);

        hub.send_error(app, ErrorCode::E101, "embedding failed");
        assert_eq!(hub.stats().connections, 0);
    }

    #[tokio::test]
    async fn reconnect_replaces_channel() {
        let hub = hub();
        let _rx1 = hub.connect("client-1", None, None);
        let _rx2 = hub.connect("client-1", Some("reviewer".into()), None);
        let stats = hub.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.clients[0].user.as_deref(), Some("reviewer"));
    }

    #[tokio::test]
    async fn message_serialization_is_tagged() {
        let msg = PushMessage::ProcessingError {
            application_id: Uuid::new_v4(),
            error_code: ErrorCode::E001,
            message: "no face".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "processing_error");
        assert_eq!(json["error_code"], "E001");
    }
}
