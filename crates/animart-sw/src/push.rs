//! Push handling: background push payload → OS-level notification.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Push handling errors.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("Malformed push payload: {0}")]
    MalformedPayload(String),

    #[error("Notification sink closed")]
    SinkClosed,
}

/// Push message body as delivered by the messaging platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub notification: NotificationContent,
    /// `null` when absent.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,
}

/// Visible part of a push payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// A notification handed to the OS.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    /// App-defined data, passed through untouched for click routing.
    pub data: JsonValue,
}

/// Where notifications are displayed.
pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: Notification) -> Result<(), PushError>;
}

/// Sink that forwards notifications over a channel to the embedding host.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotificationSink {
    fn show(&self, notification: Notification) -> Result<(), PushError> {
        self.tx.send(notification).map_err(|_| PushError::SinkClosed)
    }
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn show(&self, notification: Notification) -> Result<(), PushError> {
        info!(
            title = %notification.title,
            body = %notification.body,
            icon = %notification.icon,
            "Notification shown"
        );
        Ok(())
    }
}

/// Turns push payloads into notifications.
pub struct PushHandler {
    default_icon: String,
    sink: Arc<dyn NotificationSink>,
}

impl PushHandler {
    pub fn new(default_icon: impl Into<String>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            default_icon: default_icon.into(),
            sink,
        }
    }

    /// Handle one push event.
    ///
    /// A payload without a title or body is rejected and nothing is shown.
    pub fn handle(&self, payload: &[u8]) -> Result<Notification, PushError> {
        let payload: PushPayload = serde_json::from_slice(payload).map_err(|e| {
            warn!(error = %e, "Dropping malformed push payload");
            PushError::MalformedPayload(e.to_string())
        })?;

        let notification = Notification {
            title: payload.notification.title,
            body: payload.notification.body,
            icon: payload
                .notification
                .icon
                .unwrap_or_else(|| self.default_icon.clone()),
            data: payload.data,
        };

        self.sink.show(notification.clone())?;
        Ok(notification)
    }
}
