//! Structural validation of a plan spec (component C4).

use std::collections::BTreeSet;

use crate::v1::controllers::plancontroller::{duration, window::ParsedWindow};
use crate::v1::resources::PlanSpec;

/// Runs every structural check and joins the failures with `"; "`, matching
/// the collected-error style the status handler surfaces on `Validated=False`.
pub fn validate(spec: &PlanSpec, existing_secret_names: &BTreeSet<String>) -> Result<(), String> {
    let mut errors = Vec::new();

    if let Some(drain) = &spec.drain {
        if drain.delete_local_data.unwrap_or(false) && drain.delete_emptydir_data.unwrap_or(false)
        {
            errors.push(
                "spec.drain: cannot specify both deleteEmptydirData and deleteLocalData"
                    .to_string(),
            );
        }

        if let Some(selector) = &drain.pod_selector {
            if let Err(e) = validate_selector_syntax(selector) {
                errors.push(format!("spec.drain.podSelector: {e}"));
            }
        }

        if let Some(timeout) = &drain.timeout {
            if let Err(e) = duration::parse_signed(timeout) {
                errors.push(format!("spec.drain.timeout: {e}"));
            }
        }
    }

    if let Some(window) = &spec.window {
        if let Err(e) = ParsedWindow::parse(window) {
            errors.push(format!("spec.window: {e}"));
        }
    }

    if let Some(delay) = &spec.post_complete_delay {
        if let Err(e) = duration::parse_non_negative(delay) {
            errors.push(e.to_string());
        }
    }

    if let Some(secrets) = &spec.secrets {
        for secret in secrets {
            if !secret.ignore_updates && !existing_secret_names.contains(&secret.name) {
                errors.push(format!(
                    "spec.secrets: referenced secret {:?} does not exist",
                    secret.name
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// A minimal syntactic check for Kubernetes set-based label selector strings
/// (`key=value`, `key!=value`, `key`, `!key`, `key in (a,b)`, `key notin (a,b)`),
/// without requiring a live apiserver round-trip.
fn validate_selector_syntax(selector: &str) -> Result<(), String> {
    for requirement in selector.split(',') {
        let requirement = requirement.trim();
        if requirement.is_empty() {
            return Err("empty selector term".to_string());
        }

        if requirement.contains('(') != requirement.contains(')') {
            return Err(format!("unbalanced parentheses in {requirement:?}"));
        }

        let key_part = requirement
            .split(|c| c == '=' || c == '!' || c == ' ')
            .next()
            .unwrap_or_default();
        let key_part = key_part.trim_start_matches('!');

        if key_part.is_empty() {
            return Err(format!("missing key in selector term {requirement:?}"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1::resources::{DrainSpec, SecretSpec, TimeWindowSpec};

    #[test]
    fn test_rejects_conflicting_drain_flags() {
        let spec = PlanSpec {
            drain: Some(DrainSpec {
                delete_local_data: Some(true),
                delete_emptydir_data: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = validate(&spec, &BTreeSet::new()).unwrap_err();
        assert!(err.contains("cannot specify both"));
    }

    #[test]
    fn test_rejects_missing_secret() {
        let spec = PlanSpec {
            secrets: Some(vec![SecretSpec {
                name: "does-not-exist".into(),
                path: None,
                ignore_updates: false,
            }]),
            ..Default::default()
        };

        let err = validate(&spec, &BTreeSet::new()).unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[test]
    fn test_ignored_missing_secret_is_fine() {
        let spec = PlanSpec {
            secrets: Some(vec![SecretSpec {
                name: "does-not-exist".into(),
                path: None,
                ignore_updates: true,
            }]),
            ..Default::default()
        };

        assert!(validate(&spec, &BTreeSet::new()).is_ok());
    }

    #[test]
    fn test_rejects_bad_window() {
        let spec = PlanSpec {
            window: Some(TimeWindowSpec {
                days: vec!["never".into()],
                start_time: "02:00:00".into(),
                end_time: "04:00:00".into(),
                time_zone: None,
            }),
            ..Default::default()
        };

        assert!(validate(&spec, &BTreeSet::new()).is_err());
    }

    #[test]
    fn test_rejects_negative_delay() {
        let spec = PlanSpec {
            post_complete_delay: Some("-30s".into()),
            ..Default::default()
        };

        let err = validate(&spec, &BTreeSet::new()).unwrap_err();
        assert_eq!(err, "spec.postCompleteDelay is negative");
    }

    #[test]
    fn test_accepts_valid_spec() {
        let spec = PlanSpec {
            post_complete_delay: Some("30s".into()),
            upgrade: crate::v1::resources::ContainerSpec {
                image: "rancher/kubectl:latest".into(),
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(validate(&spec, &BTreeSet::new()).is_ok());
    }
}
