//! Terminal-status events. Each event is written to the durable outbox
//! once per subscriber and delivered at least once by [`delivery`].

pub mod delivery;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::db::{ActionStore, StoreError};
use crate::models::{Action, ActionStatus, WebhookEvent};

pub use delivery::Deliverer;

pub const ACTION_COMPLETED: &str = "action.completed";
pub const ACTION_FAILED: &str = "action.failed";
pub const ACTION_ROLLED_BACK: &str = "action.rolled_back";

pub fn event_type(status: ActionStatus) -> Option<&'static str> {
    match status {
        ActionStatus::Completed => Some(ACTION_COMPLETED),
        ActionStatus::Failed => Some(ACTION_FAILED),
        ActionStatus::RolledBack => Some(ACTION_ROLLED_BACK),
        _ => None,
    }
}

/// Consumers deduplicate on this key.
pub fn dedupe_key(action: &Action) -> String {
    format!("{}:{}", action.id, action.status)
}

pub struct Notifier {
    store: Arc<dyn ActionStore>,
    subscribers: Vec<String>,
}

impl Notifier {
    pub fn new(store: Arc<dyn ActionStore>, subscribers: Vec<String>) -> Self {
        Self { store, subscribers }
    }

    /// Enqueue the event for `action`'s current status. Returns the number
    /// of outbox rows written; statuses without an event write none.
    pub async fn action_finished(&self, action: &Action) -> Result<usize, StoreError> {
        let Some(event_type) = event_type(action.status) else {
            return Ok(0);
        };
        let key = dedupe_key(action);
        let payload = json!({
            "event": event_type,
            "dedupe_key": key,
            "occurred_at": Utc::now(),
            "action": {
                "id": action.id,
                "type": action.action_type,
                "provider": action.provider,
                "resource": action.resource,
                "status": action.status,
                "needs_manual_intervention": action.needs_manual_intervention,
                "result": action.result,
                "workflow_execution_id": action.workflow_execution_id,
                "recommendation_id": action.recommendation_id,
            },
        });

        for url in &self.subscribers {
            let event = WebhookEvent::new(event_type, action.id, key.clone(), url, payload.clone());
            self.store.enqueue_event(&event).await?;
        }
        if !self.subscribers.is_empty() {
            tracing::debug!(
                "Queued {event_type} for action {} to {} subscriber(s)",
                action.id,
                self.subscribers.len()
            );
        }
        Ok(self.subscribers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{ActionParameters, ActionType, CreateAction};

    fn finished(status: ActionStatus) -> Action {
        let request: CreateAction =
            serde_json::from_value(json!({ "type": "stop_resource", "provider": "aws" })).unwrap();
        let params = ActionParameters::parse(ActionType::StopResource, &request.parameters).unwrap();
        let mut a = Action::draft(&request, params, None, uuid::Uuid::now_v7());
        a.status = status;
        a
    }

    #[tokio::test]
    async fn one_row_per_subscriber_and_duplicates_collapse() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(
            store.clone(),
            vec!["http://a.test/hook".into(), "http://b.test/hook".into()],
        );
        let a = finished(ActionStatus::Completed);

        assert_eq!(notifier.action_finished(&a).await.unwrap(), 2);
        notifier.action_finished(&a).await.unwrap();

        let events = store.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == ACTION_COMPLETED));
        assert_eq!(events[0].dedupe_key, format!("{}:completed", a.id));
    }

    #[tokio::test]
    async fn non_terminal_statuses_emit_nothing() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(store.clone(), vec!["http://a.test/hook".into()]);
        for status in [ActionStatus::Executing, ActionStatus::Cancelled, ActionStatus::Approved] {
            assert_eq!(notifier.action_finished(&finished(status)).await.unwrap(), 0);
        }
        assert!(store.events().is_empty());
    }
}
