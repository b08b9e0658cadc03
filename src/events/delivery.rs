use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::watch;

use crate::db::{ActionStore, StoreError};

pub const SIGNATURE_HEADER: &str = "X-Cloudpilot-Signature";
pub const EVENT_HEADER: &str = "X-Cloudpilot-Event";
pub const DEDUPE_HEADER: &str = "X-Cloudpilot-Dedupe-Key";
pub const DELIVERY_HEADER: &str = "X-Cloudpilot-Delivery";

type HmacSha256 = Hmac<Sha256>;

/// `sha256=<hex>` HMAC of the raw request body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Drains the webhook outbox.
pub struct Deliverer {
    store: Arc<dyn ActionStore>,
    client: reqwest::Client,
    secret: Option<String>,
}

impl Deliverer {
    pub fn new(store: Arc<dyn ActionStore>, secret: Option<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| format!("Failed to build webhook client: {e}"))?;
        Ok(Self {
            store,
            client,
            secret,
        })
    }

    /// Deliver the next ready event. Returns true if one was attempted.
    pub async fn deliver_once(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(event) = self.store.claim_next_event(now).await? else {
            return Ok(false);
        };

        let body = serde_json::to_vec(&event.payload)?;
        let mut req = self
            .client
            .post(&event.target_url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, &event.event_type)
            .header(DEDUPE_HEADER, &event.dedupe_key)
            .header(DELIVERY_HEADER, event.id.to_string());
        if let Some(secret) = &self.secret {
            req = req.header(SIGNATURE_HEADER, sign(secret, &body));
        }

        let outcome = match req.body(body).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(512)
                    .collect::<String>();
                Err(format!("HTTP {status}: {text}"))
            }
            Err(e) => Err(format!("Request failed: {e}")),
        };

        match outcome {
            Ok(()) => {
                self.store.mark_event_delivered(event.id).await?;
                tracing::debug!(
                    "Delivered {} for action {} to {}",
                    event.event_type,
                    event.action_id,
                    event.target_url
                );
            }
            Err(error) => {
                if event.attempts >= event.max_attempts {
                    tracing::error!(
                        "Giving up on {} for action {} to {} after {} attempts: {error}",
                        event.event_type,
                        event.action_id,
                        event.target_url,
                        event.attempts
                    );
                } else {
                    tracing::warn!(
                        "Delivery of {} to {} failed (attempt {}): {error}",
                        event.event_type,
                        event.target_url,
                        event.attempts
                    );
                }
                self.store
                    .mark_event_failed(event.id, &error, Utc::now())
                    .await?;
            }
        }
        Ok(true)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("Webhook delivery loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.deliver_once(Utc::now()).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!("Webhook outbox error: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::debug!("Webhook delivery loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::Router;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::db::MemoryStore;
    use crate::models::WebhookEvent;

    type Received = Arc<Mutex<Vec<(HeaderMap, Bytes)>>>;

    async fn receiver(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::default();
        let sink = received.clone();
        let app = Router::new().route(
            "/hook",
            post(move |headers: HeaderMap, body: Bytes| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push((headers, body));
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/hook"), received)
    }

    fn event(url: &str) -> WebhookEvent {
        let action_id = Uuid::now_v7();
        WebhookEvent::new(
            "action.completed",
            action_id,
            format!("{action_id}:completed"),
            url,
            json!({ "event": "action.completed" }),
        )
    }

    #[test]
    fn signature_is_stable_hex() {
        let sig = sign("secret", b"{}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert_eq!(sig, sign("secret", b"{}"));
        assert_ne!(sig, sign("other", b"{}"));
    }

    #[tokio::test]
    async fn delivers_signed_event() {
        let (url, received) = receiver(StatusCode::OK).await;
        let store = Arc::new(MemoryStore::new());
        let e = event(&url);
        store.enqueue_event(&e).await.unwrap();

        let deliverer = Deliverer::new(store.clone(), Some("s3cret".into())).unwrap();
        assert!(deliverer.deliver_once(Utc::now()).await.unwrap());
        assert!(!deliverer.deliver_once(Utc::now()).await.unwrap());

        let received = received.lock().unwrap();
        let (headers, body) = &received[0];
        assert_eq!(headers[EVENT_HEADER], "action.completed");
        assert_eq!(headers[DEDUPE_HEADER], e.dedupe_key.as_str());
        assert_eq!(headers[SIGNATURE_HEADER], sign("s3cret", body).as_str());
        assert_eq!(store.events()[0].status, "delivered");
    }

    #[tokio::test]
    async fn failed_delivery_backs_off() {
        let (url, received) = receiver(StatusCode::SERVICE_UNAVAILABLE).await;
        let store = Arc::new(MemoryStore::new());
        store.enqueue_event(&event(&url)).await.unwrap();

        let deliverer = Deliverer::new(store.clone(), None).unwrap();
        let now = Utc::now();
        assert!(deliverer.deliver_once(now).await.unwrap());
        // Not ready again until the backoff has passed.
        assert!(!deliverer.deliver_once(now).await.unwrap());
        assert!(
            deliverer
                .deliver_once(now + chrono::Duration::seconds(3))
                .await
                .unwrap()
        );

        let stored = &store.events()[0];
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.status, "failed");
        assert!(stored.last_error.as_deref().unwrap().contains("503"));
        assert_eq!(received.lock().unwrap().len(), 2);
        assert!(!received.lock().unwrap()[0].0.contains_key(SIGNATURE_HEADER));
    }
}
