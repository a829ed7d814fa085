//! Outbound notification dispatch
//!
//! The engine only produces fire/resolve events; this module is the boundary
//! adapter that pushes them somewhere. Delivery failures are logged and
//! dropped — retry and confirmation belong to whatever sits behind the
//! webhook, not to the alert engine.

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::actors::messages::AlertEvent;

/// Request timeout for a single webhook delivery. Without one a hung
/// webhook would stall the drain and back-pressure the scheduler.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts every alert event to a webhook as a JSON payload.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(DELIVERY_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
            url: url.to_string(),
        }
    }

    /// Drain the event channel until it closes.
    pub fn spawn(self, mut events: mpsc::Receiver<AlertEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.deliver(&event).await;
            }
        })
    }

    #[instrument(skip(self, event), fields(rule = %event.rule()))]
    async fn deliver(&self, event: &AlertEvent) {
        let payload = match event {
            AlertEvent::Fire { rule, value, at, message, priority } => json!({
                "kind": "fire",
                "rule": rule,
                "value": value,
                "message": message,
                "priority": priority,
                "timestamp": at.to_rfc3339(),
                "sent_at": Utc::now().to_rfc3339(),
            }),
            AlertEvent::Resolve { rule, at } => json!({
                "kind": "resolve",
                "rule": rule,
                "timestamp": at.to_rfc3339(),
                "sent_at": Utc::now().to_rfc3339(),
            }),
        };

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("delivered alert webhook");
                } else {
                    error!("alert webhook failed with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("failed to send alert webhook: {e}");
            }
        }
    }
}

/// Fallback when no webhook is configured: log every event.
pub fn spawn_log_drain(mut events: mpsc::Receiver<AlertEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                AlertEvent::Fire { rule, value, message, .. } => {
                    info!(%rule, value, "ALERT FIRING: {message}");
                }
                AlertEvent::Resolve { rule, .. } => {
                    info!(%rule, "alert resolved");
                }
            }
        }
    })
}
