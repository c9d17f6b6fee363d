//! HTTP channel resolution (component C2).
//!
//! A channel server is deliberately dumb: it answers a GET with a redirect
//! whose `Location` names the latest version, or - for servers that prefer
//! to just be a static manifest - a plain 2xx whose own URL basename is
//! taken as the version. Anything else is a resolution failure.

use std::time::Duration;

use reqwest::{StatusCode, redirect::Policy};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("channel request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("channel returned {status} with no usable Location header")]
    Unexpected { status: StatusCode },

    #[error("channel redirected to a Location header that isn't a valid URL: {0}")]
    InvalidLocation(String),

    #[error("channel URL is invalid: {0}")]
    InvalidChannelUrl(#[from] url::ParseError),
}

pub struct ChannelClient {
    http: reqwest::Client,
}

impl ChannelClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .expect("reqwest client with disabled redirects must build");

        Self { http }
    }

    /// Resolves `channel_url` to a version token, then munges it (`+` -> `-`).
    pub async fn resolve(
        &self,
        channel_url: &str,
        latest_version: &str,
        cluster_id: &str,
    ) -> Result<String, ResolveError> {
        let url = Url::parse(channel_url)?;

        let mut request = self.http.get(url.clone());
        if !cluster_id.is_empty() {
            request = request.header("X-SUC-Cluster-ID", cluster_id);
        }
        if !latest_version.is_empty() {
            request = request.header("X-SUC-Latest-Version", latest_version);
        }

        let response = request.send().await?;
        let status = response.status();

        let raw_version = if status == StatusCode::FOUND {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(ResolveError::Unexpected { status })?;

            let resolved = url
                .join(location)
                .map_err(|_| ResolveError::InvalidLocation(location.to_string()))?;

            basename(resolved.path())
        } else if status.is_success() {
            basename(url.path())
        } else {
            return Err(ResolveError::Unexpected { status });
        };

        Ok(munge(&raw_version))
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path).to_string()
}

/// Many image tag registries reject `+`, which is otherwise valid in semver build metadata.
pub fn munge(version: &str) -> String {
    version.replace('+', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_munge_replaces_plus() {
        assert_eq!(munge("v1.2.3+test"), "v1.2.3-test");
        assert_eq!(munge("v1.2.3"), "v1.2.3");
    }

    #[test]
    fn test_basename_takes_last_path_segment() {
        assert_eq!(basename("/local/test"), "test");
        assert_eq!(basename("/local/test/v1.2.3+test"), "v1.2.3+test");
        assert_eq!(basename("/"), "/");
    }
}
