//! Maps an incoming cost recommendation onto an action request.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::EngineError;
use crate::models::{ActionType, CreateAction, Provider, RiskLevel};

const TAG_PLACEHOLDER: &str = "Please update";

#[derive(Debug, Clone, Deserialize)]
pub struct RecommendedResource {
    pub resource_id: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Recommendation envelope as produced by the recommendation service.
#[derive(Debug, Clone, Deserialize)]
pub struct Recommendation {
    pub recommendation_id: Uuid,
    pub recommendation_type: String,
    pub provider: Provider,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub resource: Option<RecommendedResource>,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub estimated_savings: Option<f64>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub scheduled_time: Option<chrono::DateTime<chrono::Utc>>,
}

fn first_str<'a>(details: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| details.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

fn action_type(recommendation_type: &str) -> Result<ActionType, EngineError> {
    Ok(match recommendation_type {
        "resize_resource" => ActionType::ResizeResource,
        "idle_resource" => ActionType::StopResource,
        "delete_resource" => ActionType::DeleteResource,
        "purchase_reservation" => ActionType::PurchaseReservation,
        "missing_tags" => ActionType::AddTags,
        "optimize_storage" => ActionType::OptimizeStorage,
        other => {
            return Err(EngineError::Validation(format!(
                "recommendation type {other} has no matching action"
            )));
        }
    })
}

fn parameters(action_type: ActionType, details: &Map<String, Value>) -> Result<Value, EngineError> {
    let missing = |what: &str| EngineError::Validation(format!("recommendation details lack {what}"));

    Ok(match action_type {
        ActionType::ResizeResource => {
            let target = first_str(
                details,
                &[
                    "recommended_instance_type",
                    "recommended_vm_size",
                    "recommended_machine_type",
                ],
            )
            .ok_or_else(|| missing("a recommended size"))?;
            let apply_immediately =
                details.get("provider_type").and_then(Value::as_str) == Some("azure_advisor");
            json!({ "target_size": target, "apply_immediately": apply_immediately })
        }
        ActionType::StopResource => match first_str(details, &["suggested_action"]) {
            Some("stop_instance") => json!({ "force": true }),
            Some("stop_vm") => json!({ "deallocate": true }),
            _ => json!({}),
        },
        ActionType::AddTags => {
            let keys: Vec<String> = match details.get("suggested_tags") {
                Some(Value::Array(keys)) => keys
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect(),
                Some(Value::Object(map)) => map.keys().cloned().collect(),
                _ => Vec::new(),
            };
            if keys.is_empty() {
                return Err(missing("suggested_tags"));
            }
            let tags: Map<String, Value> = keys
                .into_iter()
                .map(|k| (k, json!(TAG_PLACEHOLDER)))
                .collect();
            json!({ "tags": tags })
        }
        ActionType::OptimizeStorage => {
            let class = first_str(details, &["recommended_storage_class", "recommended_access_tier"])
                .ok_or_else(|| missing("a recommended storage class"))?;
            json!({ "storage_class": class })
        }
        ActionType::PurchaseReservation => {
            let offering = first_str(details, &["offering", "recommended_offering", "instance_type"])
                .ok_or_else(|| missing("an offering"))?;
            let mut params = json!({
                "offering": offering,
                "term_months": details.get("term_months").and_then(Value::as_u64).unwrap_or(12),
                "quantity": details.get("quantity").and_then(Value::as_u64).unwrap_or(1),
            });
            if let Some(option) = first_str(details, &["payment_option"]) {
                params["payment_option"] = json!(option);
            }
            if let Some(region) = first_str(details, &["region"]) {
                params["region"] = json!(region);
            }
            params
        }
        ActionType::DeleteResource => json!({}),
        ActionType::StartResource | ActionType::TerraformApply | ActionType::TerraformDestroy => {
            return Err(EngineError::Validation(format!(
                "{action_type} is not produced from recommendations"
            )));
        }
    })
}

fn risk(priority: Option<&str>) -> Option<RiskLevel> {
    match priority.map(str::to_ascii_lowercase).as_deref() {
        Some("high") | Some("critical") => Some(RiskLevel::High),
        Some("medium") => Some(RiskLevel::Medium),
        Some("low") => Some(RiskLevel::Low),
        _ => None,
    }
}

pub fn to_action_request(rec: &Recommendation) -> Result<CreateAction, EngineError> {
    let action_type = action_type(&rec.recommendation_type)?;
    let parameters = parameters(action_type, &rec.details)?;

    if action_type.targets_resource() && rec.resource.is_none() {
        return Err(EngineError::Validation(format!(
            "{} recommendations must name a resource",
            rec.recommendation_type
        )));
    }

    let cost_impact = rec
        .details
        .get("cost_impact")
        .and_then(Value::as_f64)
        .or(rec.estimated_savings);
    let description = first_str(&rec.details, &["description"])
        .map(String::from)
        .or_else(|| {
            Some(match &rec.resource {
                Some(r) => format!("{} for {}", rec.recommendation_type, r.resource_id),
                None => rec.recommendation_type.clone(),
            })
        });

    Ok(CreateAction {
        action_type,
        provider: rec.provider,
        account_id: rec.account_id.clone(),
        resource_id: rec.resource.as_ref().map(|r| r.resource_id.clone()),
        resource_type: rec.resource.as_ref().and_then(|r| r.resource_type.clone()),
        parameters,
        description,
        recommendation_id: Some(rec.recommendation_id),
        workflow_execution_id: None,
        risk: risk(rec.priority.as_deref()),
        cost_impact,
        estimated_savings: rec.estimated_savings,
        resource_tags: rec
            .resource
            .as_ref()
            .map(|r| r.tags.clone())
            .unwrap_or_default(),
        scheduled_time: rec.scheduled_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionParameters;

    fn rec(body: Value) -> Recommendation {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn resize_takes_the_provider_specific_size() {
        let r = rec(json!({
            "recommendation_id": Uuid::now_v7(),
            "recommendation_type": "resize_resource",
            "provider": "azure",
            "resource": { "resource_id": "vm-1", "resource_type": "virtual_machine" },
            "details": { "recommended_vm_size": "Standard_B2s", "provider_type": "azure_advisor" },
            "estimated_savings": 42.0,
            "priority": "High",
        }));
        let req = to_action_request(&r).unwrap();
        assert_eq!(req.action_type, ActionType::ResizeResource);
        assert_eq!(req.parameters, json!({ "target_size": "Standard_B2s", "apply_immediately": true }));
        assert_eq!(req.risk, Some(RiskLevel::High));
        assert_eq!(req.recommendation_id, Some(r.recommendation_id));
        assert!(ActionParameters::parse(req.action_type, &req.parameters).is_ok());
    }

    #[test]
    fn idle_resource_becomes_a_stop() {
        let r = rec(json!({
            "recommendation_id": Uuid::now_v7(),
            "recommendation_type": "idle_resource",
            "provider": "azure",
            "resource": { "resource_id": "vm-1" },
            "details": { "suggested_action": "stop_vm" },
        }));
        let req = to_action_request(&r).unwrap();
        assert_eq!(req.action_type, ActionType::StopResource);
        assert_eq!(req.parameters, json!({ "deallocate": true }));
    }

    #[test]
    fn missing_tags_get_placeholder_values() {
        let r = rec(json!({
            "recommendation_id": Uuid::now_v7(),
            "recommendation_type": "missing_tags",
            "provider": "aws",
            "resource": { "resource_id": "i-1", "resource_type": "ec2_instance" },
            "details": { "suggested_tags": ["owner", "cost-center"] },
        }));
        let req = to_action_request(&r).unwrap();
        assert_eq!(
            req.parameters,
            json!({ "tags": { "owner": "Please update", "cost-center": "Please update" } })
        );
    }

    #[test]
    fn storage_accepts_access_tier() {
        let r = rec(json!({
            "recommendation_id": Uuid::now_v7(),
            "recommendation_type": "optimize_storage",
            "provider": "azure",
            "resource": { "resource_id": "sa1", "resource_type": "storage_account" },
            "details": { "recommended_access_tier": "Cool" },
        }));
        assert_eq!(
            to_action_request(&r).unwrap().parameters,
            json!({ "storage_class": "Cool" })
        );
    }

    #[test]
    fn unmappable_types_are_rejected() {
        let r = rec(json!({
            "recommendation_id": Uuid::now_v7(),
            "recommendation_type": "cost_anomaly",
            "provider": "gcp",
        }));
        assert!(matches!(to_action_request(&r), Err(EngineError::Validation(_))));
    }

    #[test]
    fn resize_without_target_is_rejected() {
        let r = rec(json!({
            "recommendation_id": Uuid::now_v7(),
            "recommendation_type": "resize_resource",
            "provider": "aws",
            "resource": { "resource_id": "i-1" },
        }));
        assert!(matches!(to_action_request(&r), Err(EngineError::Validation(_))));
    }
}
