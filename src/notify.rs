use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::SurfacedError;

/// Events pushed to every connected dashboard, serialized as `{"event": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Notification {
    ArticleGenerated {
        article_id: String,
        title: String,
    },
    GenerationFailed {
        session_id: String,
        error: SurfacedError,
    },
    PublishSuccess {
        article_id: String,
        platform: String,
    },
    PublishFailed {
        article_id: String,
        platform: String,
        error: String,
    },
    HotspotUpdated {
        source: String,
        new_items: usize,
    },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::ArticleGenerated { .. } => "article_generated",
            Notification::GenerationFailed { .. } => "generation_failed",
            Notification::PublishSuccess { .. } => "publish_success",
            Notification::PublishFailed { .. } => "publish_failed",
            Notification::HotspotUpdated { .. } => "hotspot_updated",
        }
    }
}

/// Fan-out of notifications. Subscribers see every event published after they subscribed;
/// a subscriber that falls more than `capacity` events behind loses the oldest ones.
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        let name = notification.name();
        match self.tx.send(notification) {
            Ok(receivers) => debug!(event = name, receivers, "notification published"),
            Err(_) => debug!(event = name, "notification published with no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hotspot(n: usize) -> Notification {
        Notification::HotspotUpdated {
            source: "weibo".into(),
            new_items: n,
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_event() {
        let bus = NotificationBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(hotspot(1));
        bus.publish(Notification::PublishSuccess {
            article_id: "a1".into(),
            platform: "zhihu".into(),
        });

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap(), hotspot(1));
            assert_eq!(rx.recv().await.unwrap().name(), "publish_success");
        }
    }

    #[tokio::test]
    async fn late_subscribers_only_see_later_events() {
        let bus = NotificationBus::new(16);
        bus.publish(hotspot(1));
        let mut rx = bus.subscribe();
        bus.publish(hotspot(2));
        assert_eq!(rx.recv().await.unwrap(), hotspot(2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = NotificationBus::new(4);
        bus.publish(hotspot(3));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_what_it_missed() {
        let bus = NotificationBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..5 {
            bus.publish(hotspot(n));
        }
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap(), hotspot(3));
    }

    #[test]
    fn wire_shape() {
        let json = serde_json::to_value(Notification::ArticleGenerated {
            article_id: "a1".into(),
            title: "t".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "article_generated");
        assert_eq!(json["articleId"], "a1");
    }
}
