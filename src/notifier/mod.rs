//! Out-of-band status delivery.
//!
//! Two paths, used together: a webhook sink POSTs status transitions to a
//! caller-supplied URL with bounded retries, and a push hub fans processing
//! progress out to long-lived subscriber channels.

pub mod push;
pub mod webhook;

pub use push::{ChannelMeta, PushHub, PushMessage, PushStats};
pub use webhook::{WebhookConfig, WebhookError, WebhookSink};
