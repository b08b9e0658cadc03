//! HTTP client for per-provider gateways that front the real cloud SDKs.
//!
//! - `GET  {base}/resources/{resource_type}/{resource_id}`
//! - `POST {base}/operations/{operation}` with an `Idempotency-Key` header
//! - `GET  {base}/reservations/{reservation_id}`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::{CloudApi, CloudRequest, ProviderError, Reservation, ResourceState};
use crate::models::{Provider, ResourceRef};

pub struct GatewayCloud {
    client: reqwest::Client,
    base_urls: HashMap<Provider, String>,
}

impl GatewayCloud {
    pub fn new(base_urls: HashMap<Provider, String>, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to build gateway client: {e}"))?;
        let base_urls = base_urls
            .into_iter()
            .map(|(p, url)| (p, url.trim_end_matches('/').to_string()))
            .collect();
        Ok(Self { client, base_urls })
    }

    fn base(&self, provider: Provider) -> Result<&str, ProviderError> {
        self.base_urls
            .get(&provider)
            .map(String::as_str)
            .ok_or_else(|| ProviderError::Permanent(format!("No gateway configured for {provider}")))
    }

    async fn get_optional<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, ProviderError> {
        let resp = self.client.get(url).send().await.map_err(transport_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp).await?;
        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| ProviderError::Permanent(format!("Malformed gateway response: {e}")))
    }
}

/// Network failures and timeouts are worth retrying.
fn transport_error(err: reqwest::Error) -> ProviderError {
    ProviderError::Retryable(format!("Gateway request failed: {err}"))
}

/// Map an HTTP status to the retry classification.
pub fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("Gateway returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ProviderError::Retryable(message)
    } else {
        ProviderError::Permanent(message)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(1024)
        .collect::<String>();
    Err(classify_status(status, &body))
}

#[async_trait]
impl CloudApi for GatewayCloud {
    async fn describe(&self, resource: &ResourceRef) -> Result<Option<ResourceState>, ProviderError> {
        let url = format!(
            "{}/resources/{}/{}",
            self.base(resource.provider)?,
            resource.resource_type,
            resource.resource_id
        );
        self.get_optional(&url).await
    }

    async fn invoke(&self, request: &CloudRequest) -> Result<serde_json::Value, ProviderError> {
        let url = format!(
            "{}/operations/{}",
            self.base(request.provider)?,
            request.operation
        );
        let resp = self
            .client
            .post(&url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    async fn describe_reservation(
        &self,
        provider: Provider,
        reservation_id: &str,
    ) -> Result<Option<Reservation>, ProviderError> {
        let url = format!("{}/reservations/{reservation_id}", self.base(provider)?);
        self.get_optional(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::CONFLICT,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            assert!(!classify_status(status, "denied").is_retryable(), "{status}");
        }
    }

    #[test]
    fn missing_gateway_is_a_permanent_error() {
        let cloud = GatewayCloud::new(HashMap::new(), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            cloud.base(Provider::Gcp),
            Err(ProviderError::Permanent(_))
        ));
    }
}
