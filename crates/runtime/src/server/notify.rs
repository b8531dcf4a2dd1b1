//! Best-effort delivery of notifications to the foreground listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use librarian_config::CallbackConfig;

use crate::protocol::Notification;
use crate::wire;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

pub type SharedSink = Arc<dyn NotificationSink>;

/// Opens a fresh connection per notification, writes one frame, closes.
#[derive(Debug, Clone)]
pub struct CallbackSink {
    address: String,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl CallbackSink {
    pub fn new(config: &CallbackConfig, write_timeout: Duration) -> Self {
        Self {
            address: config.address(),
            connect_timeout: config.connect_timeout(),
            write_timeout,
        }
    }
}

#[async_trait]
impl NotificationSink for CallbackSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .with_context(|| format!("connect to {} timed out", self.address))?
            .with_context(|| format!("connect to {}", self.address))?;
        timeout(self.write_timeout, wire::write_message(&mut stream, notification))
            .await
            .context("notification write timed out")??;
        let _ = stream.shutdown().await;
        Ok(())
    }
}

/// Used when no callback port is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSink;

#[async_trait]
impl NotificationSink for DisabledSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        tracing::debug!(event = notification.event.as_str(), "push disabled; notification dropped");
        Ok(())
    }
}

/// Keeps every delivered notification in memory.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: tokio::sync::Mutex<Vec<Notification>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingSink {
    pub async fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().await.clone()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.delivered.lock().await.push(notification.clone());
        Ok(())
    }
}

pub fn sink_for(config: &CallbackConfig, write_timeout: Duration) -> SharedSink {
    if config.enabled() {
        Arc::new(CallbackSink::new(config, write_timeout))
    } else {
        Arc::new(DisabledSink)
    }
}
