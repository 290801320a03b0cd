//! Delivery channels
//!
//! A channel takes `(destination, content)` and reports success or failure.
//! The stock channels route through the matching platform connector's
//! outbound `send`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{Result, StewardError};
use crate::platform::{ConnectorRegistry, PlatformConnector};
use crate::types::{ChannelKind, DeliveryTarget, Platform};

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn deliver(&self, user_id: &str, destination: &str, title: &str, content: &str) -> Result<()>;
}

/// Delivery through a platform connector's outbound action
pub struct ConnectorDelivery {
    kind: ChannelKind,
    connector: Arc<dyn PlatformConnector>,
}

impl ConnectorDelivery {
    pub fn new(kind: ChannelKind, connector: Arc<dyn PlatformConnector>) -> Self {
        Self { kind, connector }
    }

    fn action(&self) -> &'static str {
        match self.kind {
            ChannelKind::Email => "send_email",
            ChannelKind::ChatPost => "post_message",
            ChannelKind::Document => "update_page",
        }
    }
}

#[async_trait]
impl DeliveryChannel for ConnectorDelivery {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn deliver(&self, user_id: &str, destination: &str, title: &str, content: &str) -> Result<()> {
        let payload = match self.kind {
            ChannelKind::Email => json!({"to": destination, "subject": title, "body": content}),
            ChannelKind::ChatPost => json!({"channel": destination, "text": format!("*{}*\n\n{}", title, content)}),
            ChannelKind::Document => json!({"page_id": destination, "title": title, "content": content}),
        };
        self.connector
            .send(user_id, self.action(), payload)
            .await
            .map(|_| ())
            .map_err(|e| StewardError::Delivery(format!("{} via {}: {}", self.action(), self.connector.platform(), e)))
    }
}

/// Channels by kind
#[derive(Clone, Default)]
pub struct DeliveryRegistry {
    channels: HashMap<ChannelKind, Arc<dyn DeliveryChannel>>,
}

impl DeliveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.channels.insert(channel.kind(), channel);
        self
    }

    /// Email over Gmail, posts over Slack, documents over Notion, for whichever are connected
    pub fn from_connectors(connectors: &ConnectorRegistry) -> Self {
        let routes = [
            (ChannelKind::Email, Platform::Gmail),
            (ChannelKind::ChatPost, Platform::Slack),
            (ChannelKind::Document, Platform::Notion),
        ];
        let mut registry = Self::new();
        for (kind, platform) in routes {
            if let Some(connector) = connectors.get(platform) {
                registry = registry.with(Arc::new(ConnectorDelivery::new(kind, connector)));
            }
        }
        registry
    }

    pub async fn deliver(
        &self,
        user_id: &str,
        target: &DeliveryTarget,
        title: &str,
        content: &str,
    ) -> Result<()> {
        let channel = self.channels.get(&target.channel).ok_or_else(|| {
            StewardError::Delivery(format!("no channel configured for {:?}", target.channel))
        })?;
        channel.deliver(user_id, &target.destination, title, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::InMemoryConnector;

    #[tokio::test]
    async fn test_routes_to_connector_send() {
        let slack = Arc::new(InMemoryConnector::new(Platform::Slack));
        let registry = DeliveryRegistry::from_connectors(&ConnectorRegistry::new().with(slack.clone()));

        registry
            .deliver(
                "u1",
                &DeliveryTarget {
                    channel: ChannelKind::ChatPost,
                    destination: "#team".to_string(),
                },
                "Status",
                "All green",
            )
            .await
            .unwrap();

        let sent = slack.sent();
        assert_eq!(sent[0].0, "post_message");
        assert_eq!(sent[0].1["channel"], "#team");
    }

    #[tokio::test]
    async fn test_missing_channel_is_delivery_error() {
        let registry = DeliveryRegistry::new();
        let result = registry
            .deliver(
                "u1",
                &DeliveryTarget {
                    channel: ChannelKind::Email,
                    destination: "me@acme.io".to_string(),
                },
                "Digest",
                "...",
            )
            .await;
        assert!(matches!(result, Err(StewardError::Delivery(_))));
    }
}
