//! Resource types, provider-native operation names and value formats for
//! each provider.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{ActionType, Provider};

pub const TERRAFORM_DEPLOYMENT: &str = "terraform_deployment";

const AWS_TYPES: &[&str] = &["ec2_instance", "rds_instance", "s3_bucket"];
const AZURE_TYPES: &[&str] = &["virtual_machine", "storage_account"];
const GCP_TYPES: &[&str] = &["compute_instance", "storage_bucket"];

const COMPUTE_TYPES: &[&str] = &[
    "ec2_instance",
    "rds_instance",
    "virtual_machine",
    "compute_instance",
];
const STORAGE_TYPES: &[&str] = &["s3_bucket", "storage_account", "storage_bucket"];

static AWS_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(db\.)?[a-z][a-z0-9-]*\.[a-z0-9]+$").expect("valid regex"));
static AZURE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(Standard|Basic)_[A-Za-z0-9_]+$").expect("valid regex"));
static GCP_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]*-[a-z0-9-]+$").expect("valid regex"));

pub fn resource_types(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::Aws => AWS_TYPES,
        Provider::Azure => AZURE_TYPES,
        Provider::Gcp => GCP_TYPES,
    }
}

/// Resource types an action type may target on `provider`.
pub fn accepted_types(action_type: ActionType, provider: Provider) -> Vec<&'static str> {
    let own = resource_types(provider);
    match action_type {
        ActionType::ResizeResource | ActionType::StopResource | ActionType::StartResource => own
            .iter()
            .copied()
            .filter(|t| COMPUTE_TYPES.contains(t))
            .collect(),
        ActionType::OptimizeStorage => own
            .iter()
            .copied()
            .filter(|t| STORAGE_TYPES.contains(t))
            .collect(),
        ActionType::DeleteResource | ActionType::AddTags => own.to_vec(),
        ActionType::TerraformDestroy => vec![TERRAFORM_DEPLOYMENT],
        ActionType::PurchaseReservation | ActionType::TerraformApply => Vec::new(),
    }
}

/// Provider-native operation for an action type on a resource type.
pub fn operation(action_type: ActionType, resource_type: &str) -> Option<&'static str> {
    use ActionType::*;

    let op = match (resource_type, action_type) {
        ("ec2_instance", StartResource) => "start_instance",
        ("ec2_instance", StopResource) => "stop_instance",
        ("ec2_instance", ResizeResource) => "resize_instance",
        ("ec2_instance", DeleteResource) => "terminate_instance",
        ("ec2_instance" | "rds_instance" | "s3_bucket", AddTags) => "create_tags",

        ("rds_instance", StartResource) => "start_instance",
        ("rds_instance", StopResource) => "stop_instance",
        ("rds_instance", ResizeResource) => "resize_instance",
        ("rds_instance", DeleteResource) => "delete_instance",

        ("s3_bucket", DeleteResource) => "delete_bucket",
        ("s3_bucket", OptimizeStorage) => "update_lifecycle",

        ("virtual_machine", StartResource) => "start_vm",
        ("virtual_machine", StopResource) => "stop_vm",
        ("virtual_machine", ResizeResource) => "resize_vm",
        ("virtual_machine", DeleteResource) => "delete_vm",
        ("virtual_machine" | "storage_account", AddTags) => "update_tags",

        ("storage_account", OptimizeStorage) => "update_tier",
        ("storage_account", DeleteResource) => "delete_storage_account",

        ("compute_instance", StartResource) => "start_instance",
        ("compute_instance", StopResource) => "stop_instance",
        ("compute_instance", ResizeResource) => "resize_instance",
        ("compute_instance", DeleteResource) => "delete_instance",
        ("compute_instance" | "storage_bucket", AddTags) => "set_labels",

        ("storage_bucket", DeleteResource) => "delete_bucket",
        ("storage_bucket", OptimizeStorage) => "update_storage_class",

        _ => return None,
    };
    Some(op)
}

pub fn reservation_operation(provider: Provider) -> &'static str {
    match provider {
        Provider::Aws => "purchase_reserved_instances",
        Provider::Azure => "purchase_reservation",
        Provider::Gcp => "create_commitment",
    }
}

pub fn validate_size(provider: Provider, size: &str) -> Result<(), String> {
    let (re, example) = match provider {
        Provider::Aws => (&*AWS_SIZE, "m5.large"),
        Provider::Azure => (&*AZURE_SIZE, "Standard_D2s_v3"),
        Provider::Gcp => (&*GCP_SIZE, "e2-standard-4"),
    };
    if re.is_match(size) {
        Ok(())
    } else {
        Err(format!(
            "'{size}' is not a valid {provider} size (expected something like {example})"
        ))
    }
}

pub fn storage_classes(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::Aws => &[
            "STANDARD",
            "STANDARD_IA",
            "ONEZONE_IA",
            "INTELLIGENT_TIERING",
            "GLACIER_IR",
            "GLACIER",
            "DEEP_ARCHIVE",
        ],
        Provider::Azure => &["Hot", "Cool", "Cold", "Archive"],
        Provider::Gcp => &["STANDARD", "NEARLINE", "COLDLINE", "ARCHIVE"],
    }
}

pub fn validate_storage_class(provider: Provider, class: &str) -> Result<(), String> {
    if storage_classes(provider).contains(&class) {
        Ok(())
    } else {
        Err(format!(
            "'{class}' is not a {provider} storage class (one of {})",
            storage_classes(provider).join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_accepted_type_has_an_operation() {
        for provider in Provider::ALL {
            for action_type in [
                ActionType::ResizeResource,
                ActionType::StopResource,
                ActionType::StartResource,
                ActionType::DeleteResource,
                ActionType::AddTags,
                ActionType::OptimizeStorage,
            ] {
                for rt in accepted_types(action_type, *provider) {
                    assert!(
                        operation(action_type, rt).is_some(),
                        "{provider} {action_type} on {rt} has no operation"
                    );
                }
            }
        }
    }

    #[test]
    fn operation_names_follow_provider_vocabulary() {
        assert_eq!(
            operation(ActionType::DeleteResource, "ec2_instance"),
            Some("terminate_instance")
        );
        assert_eq!(
            operation(ActionType::ResizeResource, "virtual_machine"),
            Some("resize_vm")
        );
        assert_eq!(
            operation(ActionType::OptimizeStorage, "storage_bucket"),
            Some("update_storage_class")
        );
        assert_eq!(operation(ActionType::OptimizeStorage, "ec2_instance"), None);
    }

    #[test]
    fn storage_actions_only_target_storage() {
        assert_eq!(
            accepted_types(ActionType::OptimizeStorage, Provider::Aws),
            vec!["s3_bucket"]
        );
        assert!(accepted_types(ActionType::StopResource, Provider::Gcp)
            .contains(&"compute_instance"));
        assert!(!accepted_types(ActionType::StopResource, Provider::Gcp)
            .contains(&"storage_bucket"));
    }

    #[test]
    fn sizes_are_checked_per_provider() {
        assert!(validate_size(Provider::Aws, "m5.large").is_ok());
        assert!(validate_size(Provider::Aws, "db.r5.xlarge").is_ok());
        assert!(validate_size(Provider::Aws, "Standard_D2s_v3").is_err());
        assert!(validate_size(Provider::Azure, "Standard_D2s_v3").is_ok());
        assert!(validate_size(Provider::Azure, "m5.large").is_err());
        assert!(validate_size(Provider::Gcp, "e2-standard-4").is_ok());
        assert!(validate_size(Provider::Gcp, "m5.large").is_err());
    }
}
