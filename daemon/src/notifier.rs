// Out-of-band delivery of operator decisions to the interception hook.

use log::debug;
use policy_core::{Resolution, ResolutionNotifier};
use tokio::sync::broadcast;

/// Fans resolutions out to every subscribed hook adapter
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Resolution>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Resolution> {
        self.tx.subscribe()
    }
}

impl ResolutionNotifier for BroadcastNotifier {
    fn notify(&self, resolution: &Resolution) {
        if self.tx.send(resolution.clone()).is_err() {
            debug!(
                "No hook subscribed; resolution of {} not delivered",
                resolution.pending_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_core::{
        BlockOrAllowList, DecisionEngine, Endpoint, Flow, ProfileManager, Protocol, RuleAction,
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn test_resolution_reaches_subscriber() {
        let engine = DecisionEngine::new(
            ProfileManager::new(),
            BlockOrAllowList::new(),
            BlockOrAllowList::new(),
        );
        let notifier = Arc::new(BroadcastNotifier::new(4));
        let mut rx = notifier.subscribe();
        engine.add_notifier(notifier);

        let flow = Flow::new(
            "com.example.app",
            Endpoint::from_ip("93.184.216.34".parse().unwrap(), 443),
            Protocol::Tcp,
        );
        let id = engine.evaluate(&flow).pending_id().unwrap();
        let rule = engine.resolve_pending(&id, RuleAction::Block).unwrap();

        let resolution = rx.recv().await.unwrap();
        assert_eq!(resolution.pending_id, id);
        assert_eq!(resolution.rule_id, rule.id);
        assert_eq!(resolution.action, RuleAction::Block);
        assert_eq!(resolution.flow, flow);
    }

    #[test]
    fn test_notify_without_subscribers_is_harmless() {
        let notifier = BroadcastNotifier::new(1);
        notifier.notify(&Resolution {
            pending_id: uuid::Uuid::new_v4(),
            flow: Flow::new(
                "com.example.app",
                Endpoint::from_host("example.com", 80),
                Protocol::Tcp,
            ),
            action: RuleAction::Allow,
            rule_id: policy_core::RuleId::new(),
        });
    }
}
