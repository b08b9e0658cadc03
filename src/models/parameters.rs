//! Typed, schema-checked parameter payloads, one shape per action type.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::ActionType;

static TAG_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9 _.:/=+\-@]{1,128}$").expect("valid tag regex"));

const PAYMENT_OPTIONS: [&str; 3] = ["all_upfront", "partial_upfront", "no_upfront"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResizeParams {
    #[serde(alias = "instance_type", alias = "vm_size", alias = "machine_type")]
    pub target_size: String,
    #[serde(default)]
    pub apply_immediately: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StopParams {
    #[serde(default)]
    pub force: bool,
    /// Azure: release compute billing as well as powering off.
    #[serde(default)]
    pub deallocate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StartParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddTagsParams {
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizeStorageParams {
    #[serde(alias = "access_tier")]
    pub storage_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PurchaseReservationParams {
    /// Instance type / SKU the reservation covers.
    pub offering: String,
    pub term_months: u32,
    pub quantity: u32,
    #[serde(default = "default_payment_option")]
    pub payment_option: String,
    #[serde(default)]
    pub region: Option<String>,
}

fn default_payment_option() -> String {
    "no_upfront".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerraformApplyParams {
    pub template_id: String,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerraformDestroyParams {
    pub deployment_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionParameters {
    Resize(ResizeParams),
    Stop(StopParams),
    Start(StartParams),
    Delete(DeleteParams),
    AddTags(AddTagsParams),
    OptimizeStorage(OptimizeStorageParams),
    PurchaseReservation(PurchaseReservationParams),
    TerraformApply(TerraformApplyParams),
    TerraformDestroy(TerraformDestroyParams),
}

impl ActionParameters {
    /// Parse and validate a raw payload against the schema for `action_type`.
    pub fn parse(action_type: ActionType, raw: &serde_json::Value) -> Result<Self, String> {
        let raw = if raw.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            raw.clone()
        };

        let params = match action_type {
            ActionType::ResizeResource => ActionParameters::Resize(decode(action_type, raw)?),
            ActionType::StopResource => ActionParameters::Stop(decode(action_type, raw)?),
            ActionType::StartResource => ActionParameters::Start(decode(action_type, raw)?),
            ActionType::DeleteResource => ActionParameters::Delete(decode(action_type, raw)?),
            ActionType::AddTags => ActionParameters::AddTags(decode(action_type, raw)?),
            ActionType::OptimizeStorage => {
                ActionParameters::OptimizeStorage(decode(action_type, raw)?)
            }
            ActionType::PurchaseReservation => {
                ActionParameters::PurchaseReservation(decode(action_type, raw)?)
            }
            ActionType::TerraformApply => {
                ActionParameters::TerraformApply(decode(action_type, raw)?)
            }
            ActionType::TerraformDestroy => {
                ActionParameters::TerraformDestroy(decode(action_type, raw)?)
            }
        };

        params.check()?;
        Ok(params)
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            ActionParameters::Resize(_) => ActionType::ResizeResource,
            ActionParameters::Stop(_) => ActionType::StopResource,
            ActionParameters::Start(_) => ActionType::StartResource,
            ActionParameters::Delete(_) => ActionType::DeleteResource,
            ActionParameters::AddTags(_) => ActionType::AddTags,
            ActionParameters::OptimizeStorage(_) => ActionType::OptimizeStorage,
            ActionParameters::PurchaseReservation(_) => ActionType::PurchaseReservation,
            ActionParameters::TerraformApply(_) => ActionType::TerraformApply,
            ActionParameters::TerraformDestroy(_) => ActionType::TerraformDestroy,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn check(&self) -> Result<(), String> {
        match self {
            ActionParameters::Resize(p) => {
                if p.target_size.trim().is_empty() {
                    return Err("target_size must not be empty".to_string());
                }
            }
            ActionParameters::AddTags(p) => {
                if p.tags.is_empty() {
                    return Err("tags must contain at least one entry".to_string());
                }
                for (key, value) in &p.tags {
                    if !TAG_KEY.is_match(key) || key.starts_with("aws:") {
                        return Err(format!("invalid tag key: {key}"));
                    }
                    if value.chars().count() > 256 {
                        return Err(format!("tag value for {key} exceeds 256 characters"));
                    }
                }
            }
            ActionParameters::OptimizeStorage(p) => {
                if p.storage_class.trim().is_empty() {
                    return Err("storage_class must not be empty".to_string());
                }
            }
            ActionParameters::PurchaseReservation(p) => {
                if p.offering.trim().is_empty() {
                    return Err("offering must not be empty".to_string());
                }
                if p.term_months != 12 && p.term_months != 36 {
                    return Err("term_months must be 12 or 36".to_string());
                }
                if p.quantity == 0 || p.quantity > 1000 {
                    return Err("quantity must be between 1 and 1000".to_string());
                }
                if !PAYMENT_OPTIONS.contains(&p.payment_option.as_str()) {
                    return Err(format!(
                        "payment_option must be one of {}",
                        PAYMENT_OPTIONS.join(", ")
                    ));
                }
            }
            ActionParameters::TerraformApply(p) => {
                if p.template_id.trim().is_empty() {
                    return Err("template_id must not be empty".to_string());
                }
            }
            ActionParameters::Stop(_)
            | ActionParameters::Start(_)
            | ActionParameters::Delete(_)
            | ActionParameters::TerraformDestroy(_) => {}
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(
    action_type: ActionType,
    raw: serde_json::Value,
) -> Result<T, String> {
    serde_json::from_value(raw).map_err(|e| format!("invalid parameters for {action_type}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resize_accepts_provider_specific_aliases() {
        for key in ["target_size", "instance_type", "vm_size", "machine_type"] {
            let params =
                ActionParameters::parse(ActionType::ResizeResource, &json!({ key: "m5.large" }))
                    .unwrap();
            match params {
                ActionParameters::Resize(p) => assert_eq!(p.target_size, "m5.large"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn resize_requires_target() {
        let err = ActionParameters::parse(ActionType::ResizeResource, &json!({})).unwrap_err();
        assert!(err.contains("resize_resource"), "{err}");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ActionParameters::parse(
            ActionType::StopResource,
            &json!({ "force": true, "shutdown_script": "rm -rf /" }),
        )
        .unwrap_err();
        assert!(err.contains("unknown field"), "{err}");
    }

    #[test]
    fn null_parameters_mean_empty_object() {
        let params = ActionParameters::parse(ActionType::StartResource, &json!(null)).unwrap();
        assert_eq!(params, ActionParameters::Start(StartParams {}));
    }

    #[test]
    fn tags_must_be_non_empty_and_well_formed() {
        assert!(ActionParameters::parse(ActionType::AddTags, &json!({ "tags": {} })).is_err());
        assert!(
            ActionParameters::parse(ActionType::AddTags, &json!({ "tags": { "aws:owner": "x" } }))
                .is_err()
        );
        assert!(
            ActionParameters::parse(ActionType::AddTags, &json!({ "tags": { "team": "finops" } }))
                .is_ok()
        );
    }

    #[test]
    fn reservation_terms_are_checked() {
        let bad = json!({ "offering": "m5.large", "term_months": 24, "quantity": 1 });
        assert!(ActionParameters::parse(ActionType::PurchaseReservation, &bad).is_err());

        let good = json!({ "offering": "m5.large", "term_months": 36, "quantity": 2 });
        match ActionParameters::parse(ActionType::PurchaseReservation, &good).unwrap() {
            ActionParameters::PurchaseReservation(p) => {
                assert_eq!(p.payment_option, "no_upfront");
                assert_eq!(p.quantity, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stored_value_parses_back_to_the_same_parameters() {
        let params = ActionParameters::parse(
            ActionType::TerraformApply,
            &json!({ "template_id": "web-tier", "variables": { "count": 2 } }),
        )
        .unwrap();
        let reparsed =
            ActionParameters::parse(ActionType::TerraformApply, &params.to_value()).unwrap();
        assert_eq!(params, reparsed);
        assert_eq!(params.action_type(), ActionType::TerraformApply);
    }
}
