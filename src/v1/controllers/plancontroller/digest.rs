//! Deterministic fingerprint of a plan's effective spec (component C3).
//!
//! Swapped from the teacher's order-insensitive `twox_hash::XxHash3_64` fold
//! (grounded on `execution_evaluator::calculate_execution_hash`) to a
//! straightforward SHA-224 over an explicitly ordered byte stream, because
//! the specification calls for a cryptographic digest rather than a fast
//! non-cryptographic one, and because the inputs here (a short, ordered
//! secret list) don't need order-insensitivity the way the teacher's
//! variable-length secret set did.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use sha2::{Digest, Sha224};

use crate::v1::labels;
use crate::v1::resources::Plan;

/// Fingerprint of a single secret's contents, independent of key iteration order.
fn secret_fingerprint(secret_type: Option<&str>, data: &BTreeMap<String, ByteString>) -> Vec<u8> {
    let mut hasher = Sha224::new();
    hasher.update(secret_type.unwrap_or_default().as_bytes());
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(&value.0);
        hasher.update([0u8]);
    }
    hasher.finalize().to_vec()
}

/// Resolves the annotation-selected dotted paths against the plan's own JSON representation.
fn selected_annotation_values(plan: &Plan) -> Vec<String> {
    let Some(selector) = plan
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::ANNOTATION_INCLUDE_IN_DIGEST))
    else {
        return Vec::new();
    };

    let value = serde_json::to_value(plan).unwrap_or_default();

    selector
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|path| lookup_dotted(&value, path))
        .collect()
}

fn lookup_dotted(root: &serde_json::Value, path: &str) -> String {
    let mut current = root;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    match current {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Computes `latestHash`: SHA-224 over `latestVersion`, `serviceAccountName`, the
/// annotation-selected substrings, and the ordered contents of each non-ignored secret.
pub fn digest_plan(plan: &Plan, latest_version: &str, secrets_by_name: &BTreeMap<String, Secret>) -> String {
    let mut hasher = Sha224::new();

    hasher.update(latest_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(
        plan.spec
            .service_account_name
            .as_deref()
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update([0u8]);

    for value in selected_annotation_values(plan) {
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }

    if let Some(secrets) = &plan.spec.secrets {
        for secret_spec in secrets {
            if secret_spec.ignore_updates {
                continue;
            }

            let fingerprint = secrets_by_name
                .get(&secret_spec.name)
                .map(|secret| {
                    secret_fingerprint(
                        secret.type_.as_deref(),
                        &secret.data.clone().unwrap_or_default(),
                    )
                })
                .unwrap_or_default();

            hasher.update(&fingerprint);
        }
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1::resources::{PlanSpec, SecretSpec};

    fn plan_with_secrets(secrets: Vec<SecretSpec>) -> Plan {
        Plan::new(
            "test-plan",
            PlanSpec {
                secrets: Some(secrets),
                upgrade: crate::v1::resources::ContainerSpec {
                    image: "rancher/kubectl:latest".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn secret_with_data(pairs: &[(&str, &str)]) -> Secret {
        let mut secret = Secret::default();
        secret.data = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        );
        secret
    }

    #[test]
    fn test_digest_is_deterministic() {
        let plan = plan_with_secrets(vec![SecretSpec {
            name: "creds".into(),
            path: None,
            ignore_updates: false,
        }]);
        let mut secrets = BTreeMap::new();
        secrets.insert("creds".to_string(), secret_with_data(&[("token", "abc")]));

        let a = digest_plan(&plan, "v1.2.3", &secrets);
        let b = digest_plan(&plan, "v1.2.3", &secrets);

        assert_eq!(a, b);
        assert_eq!(a.len(), 56); // SHA-224 -> 28 bytes -> 56 hex chars
    }

    #[test]
    fn test_ignored_secret_does_not_affect_digest() {
        let plan = plan_with_secrets(vec![SecretSpec {
            name: "creds".into(),
            path: None,
            ignore_updates: true,
        }]);

        let mut secrets_v1 = BTreeMap::new();
        secrets_v1.insert("creds".to_string(), secret_with_data(&[("token", "abc")]));

        let mut secrets_v2 = BTreeMap::new();
        secrets_v2.insert("creds".to_string(), secret_with_data(&[("token", "xyz")]));

        assert_eq!(
            digest_plan(&plan, "v1.2.3", &secrets_v1),
            digest_plan(&plan, "v1.2.3", &secrets_v2)
        );
    }

    #[test]
    fn test_non_ignored_secret_changes_digest() {
        let plan = plan_with_secrets(vec![SecretSpec {
            name: "creds".into(),
            path: None,
            ignore_updates: false,
        }]);

        let mut secrets_v1 = BTreeMap::new();
        secrets_v1.insert("creds".to_string(), secret_with_data(&[("token", "abc")]));

        let mut secrets_v2 = BTreeMap::new();
        secrets_v2.insert("creds".to_string(), secret_with_data(&[("token", "xyz")]));

        assert_ne!(
            digest_plan(&plan, "v1.2.3", &secrets_v1),
            digest_plan(&plan, "v1.2.3", &secrets_v2)
        );
    }

    #[test]
    fn test_secret_fingerprint_is_key_order_insensitive() {
        let mut m1 = BTreeMap::new();
        m1.insert("a".to_string(), ByteString(b"1".to_vec()));
        m1.insert("b".to_string(), ByteString(b"2".to_vec()));

        let mut m2 = BTreeMap::new();
        m2.insert("b".to_string(), ByteString(b"2".to_vec()));
        m2.insert("a".to_string(), ByteString(b"1".to_vec()));

        assert_eq!(secret_fingerprint(None, &m1), secret_fingerprint(None, &m2));
    }
}
