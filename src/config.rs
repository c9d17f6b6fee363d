//! Process-wide defaults, read once from the environment at startup and
//! treated as immutable afterwards. Grounded on the `SYSTEM_UPGRADE_JOB_*`
//! package-level defaults of the project this controller's Job-templating
//! behavior was distilled from (`defaultBackoffLimit`, `defaultKubectlImage`,
//! `defaultPrivileged`, `defaultImagePullPolicy`, ...).

use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub job_active_deadline_seconds: i64,
    pub job_max_active_deadline_seconds: Option<i64>,
    pub job_backoff_limit: i32,
    pub job_ttl_seconds_after_finished: i64,
    pub kubectl_image: String,
    pub image_pull_policy: String,
    pub privileged: bool,
    pub pod_replacement_policy: String,
    pub channel_polling_interval: Duration,
    pub channel_request_timeout: Duration,
    pub allow_user_defined_security_context: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            job_active_deadline_seconds: 900,
            job_max_active_deadline_seconds: None,
            job_backoff_limit: 2,
            job_ttl_seconds_after_finished: 900,
            kubectl_image: "rancher/kubectl:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            privileged: true,
            pod_replacement_policy: "TerminatingOrFailed".to_string(),
            channel_polling_interval: Duration::from_secs(15 * 60),
            channel_request_timeout: Duration::from_secs(30),
            allow_user_defined_security_context: false,
        }
    }
}

impl Config {
    /// Builds configuration from environment variables, falling back to the
    /// documented default - and logging, not failing, on a malformed
    /// override - for every field individually.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            job_active_deadline_seconds: env_i64(
                "SYSTEM_UPGRADE_JOB_ACTIVE_DEADLINE_SECONDS",
                defaults.job_active_deadline_seconds,
            ),
            job_max_active_deadline_seconds: std::env::var(
                "SYSTEM_UPGRADE_JOB_MAX_ACTIVE_DEADLINE_SECONDS",
            )
            .ok()
            .and_then(|raw| match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(value = %raw, "SYSTEM_UPGRADE_JOB_MAX_ACTIVE_DEADLINE_SECONDS is not a valid integer, ignoring");
                    None
                }
            }),
            job_backoff_limit: env_i32(
                "SYSTEM_UPGRADE_JOB_BACKOFF_LIMIT",
                defaults.job_backoff_limit,
            ),
            job_ttl_seconds_after_finished: env_i64(
                "SYSTEM_UPGRADE_JOB_TTL_SECONDS_AFTER_FINISHED",
                defaults.job_ttl_seconds_after_finished,
            ),
            kubectl_image: std::env::var("SYSTEM_UPGRADE_JOB_KUBECTL_IMAGE")
                .unwrap_or(defaults.kubectl_image),
            image_pull_policy: std::env::var("SYSTEM_UPGRADE_JOB_IMAGE_PULL_POLICY")
                .unwrap_or(defaults.image_pull_policy),
            privileged: env_bool("SYSTEM_UPGRADE_JOB_PRIVILEGED", defaults.privileged),
            pod_replacement_policy: std::env::var("SYSTEM_UPGRADE_JOB_POD_REPLACEMENT_POLICY")
                .unwrap_or(defaults.pod_replacement_policy),
            channel_polling_interval: Duration::from_secs(env_u64(
                "SYSTEM_UPGRADE_CHANNEL_POLLING_INTERVAL_SECONDS",
                defaults.channel_polling_interval.as_secs(),
            )),
            channel_request_timeout: Duration::from_secs(env_u64(
                "SYSTEM_UPGRADE_CHANNEL_REQUEST_TIMEOUT_SECONDS",
                defaults.channel_request_timeout.as_secs(),
            )),
            allow_user_defined_security_context: env_bool(
                "SYSTEM_UPGRADE_ALLOW_USER_DEFINED_SECURITY_CONTEXT",
                defaults.allow_user_defined_security_context,
            ),
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    env_parsed(key, default)
}

fn env_i32(key: &str, default: i32) -> i32 {
    env_parsed(key, default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_parsed(key, default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(%key, value = %raw, "malformed environment override, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => {
                warn!(%key, value = %raw, "malformed boolean environment override, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.job_backoff_limit, 2);
        assert_eq!(config.kubectl_image, "rancher/kubectl:latest");
        assert_eq!(config.image_pull_policy, "IfNotPresent");
        assert!(config.privileged);
        assert_eq!(config.channel_polling_interval, Duration::from_secs(900));
    }
}
