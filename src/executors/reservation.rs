use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{ProviderError, ProviderExecutor, ProviderResult, Snapshot, ValidationResult};
use crate::cloud::{CloudApi, CloudRequest, catalog};
use crate::models::{Action, ActionParameters, ActionType, Provider};

/// Account-level purchase of reserved capacity. Purchases are final, so
/// there is no snapshot and rollback is unsupported.
pub struct ReservationExecutor {
    provider: Provider,
    cloud: Arc<dyn CloudApi>,
}

impl ReservationExecutor {
    pub fn new(provider: Provider, cloud: Arc<dyn CloudApi>) -> Self {
        Self { provider, cloud }
    }
}

#[async_trait]
impl ProviderExecutor for ReservationExecutor {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn action_type(&self) -> ActionType {
        ActionType::PurchaseReservation
    }

    fn description(&self) -> String {
        format!("{} on {}", catalog::reservation_operation(self.provider), self.provider)
    }

    async fn validate(&self, action: &Action) -> Result<ValidationResult, ProviderError> {
        let ActionParameters::PurchaseReservation(params) = &action.parameters else {
            return Ok(ValidationResult::invalid("purchase_reservation parameters expected"));
        };

        let mut result = ValidationResult::ok();
        if let Err(e) = catalog::validate_size(self.provider, &params.offering) {
            result.error(format!("offering: {e}"));
        }
        if action.resource.is_some() {
            result.warn("reservations apply to the account; the resource reference is ignored");
        }
        if action.account_id.is_none() {
            result.warn("no account_id given, the provider default account will be charged");
        }
        Ok(result)
    }

    async fn snapshot(&self, _action: &Action) -> Result<Snapshot, ProviderError> {
        Ok(Snapshot::Unsupported(
            "reservation purchases cannot be reversed".to_string(),
        ))
    }

    async fn apply(
        &self,
        action: &Action,
        idempotency_key: &str,
    ) -> Result<ProviderResult, ProviderError> {
        let ActionParameters::PurchaseReservation(params) = &action.parameters else {
            return Err(ProviderError::Permanent(
                "purchase_reservation parameters expected".into(),
            ));
        };

        let operation = catalog::reservation_operation(self.provider);
        let request = CloudRequest {
            provider: self.provider,
            account_id: action.account_id.clone(),
            operation: operation.to_string(),
            resource: None,
            arguments: json!({
                "offering": params.offering,
                "term_months": params.term_months,
                "quantity": params.quantity,
                "payment_option": params.payment_option,
                "region": params.region,
            }),
            idempotency_key: idempotency_key.to_string(),
        };
        let response = self.cloud.invoke(&request).await?;
        Ok(ProviderResult::new(
            format!(
                "purchased {} x {} for {} months",
                params.quantity, params.offering, params.term_months
            ),
            response,
        )
        .with_savings(action.estimated_savings))
    }

    async fn verify(&self, _action: &Action, applied: &ProviderResult) -> Result<bool, ProviderError> {
        let Some(reservation_id) = applied.response["reservation_id"].as_str() else {
            return Ok(false);
        };
        let reservation = self
            .cloud
            .describe_reservation(self.provider, reservation_id)
            .await?;
        Ok(reservation.is_some_and(|r| r.state == "active"))
    }
}
