//! npm registry client.

use super::error::PkgError;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

/// Abbreviated packument media type; smaller than the full document.
const CORGI_ACCEPT: &str =
    "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8, */*";

/// Registry client for fetching package metadata.
///
/// Packuments are cached per registry and name for the lifetime of the
/// client, and requests are bounded by `network_concurrency`.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: Client,
    packuments: Arc<Mutex<HashMap<String, Arc<serde_json::Value>>>>,
    limit: Arc<Semaphore>,
}

impl RegistryClient {
    /// Create a new registry client.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(network_concurrency: usize) -> Result<Self, PkgError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("knit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PkgError::registry(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            packuments: Arc::new(Mutex::new(HashMap::new())),
            limit: Arc::new(Semaphore::new(network_concurrency.max(1))),
        })
    }

    /// Get the HTTP client (for reuse in tarball downloads).
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Shared network limiter; tarball downloads hold a permit too.
    #[must_use]
    pub fn limit(&self) -> &Arc<Semaphore> {
        &self.limit
    }

    /// Fetch the packument (package metadata) for a package.
    ///
    /// # Errors
    /// Returns an error if the request fails or the package is not found.
    pub async fn fetch_packument(
        &self,
        registry: &str,
        name: &str,
    ) -> Result<Arc<serde_json::Value>, PkgError> {
        let key = format!("{registry}{name}");
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }

        let base = Url::parse(registry)
            .map_err(|e| PkgError::registry(format!("Invalid registry URL '{registry}': {e}")))?;
        let url = base
            .join(&encode_name(name))
            .map_err(|e| PkgError::registry(format!("Failed to build URL for '{name}': {e}")))?;

        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|e| PkgError::registry(e.to_string()))?;

        tracing::debug!(name, url = %url, "fetching packument");
        let response = self
            .http
            .get(url.as_str())
            .header(reqwest::header::ACCEPT, CORGI_ACCEPT)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PkgError::not_found(name));
        }

        if !response.status().is_success() {
            return Err(PkgError::registry(format!(
                "Registry returned status {} for '{name}'",
                response.status()
            )));
        }

        let json: serde_json::Value = response.json().await?;
        let json = Arc::new(json);
        if let Ok(mut cache) = self.packuments.lock() {
            cache.insert(key, Arc::clone(&json));
        }
        Ok(json)
    }

    fn cached(&self, key: &str) -> Option<Arc<serde_json::Value>> {
        self.packuments.lock().ok()?.get(key).cloned()
    }
}

/// URL-encode a package name; scoped names encode the `/`.
#[must_use]
pub fn encode_name(name: &str) -> String {
    if name.starts_with('@') {
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}

/// The conventional tarball URL of a registry package.
#[must_use]
pub fn default_tarball_url(registry: &str, name: &str, version: &str) -> String {
    let unscoped = name.rsplit('/').next().unwrap_or(name);
    format!("{registry}{name}/-/{unscoped}-{version}.tgz")
}

/// Extract a dist-tag from a packument.
#[must_use]
pub fn get_dist_tag<'a>(packument: &'a serde_json::Value, tag: &str) -> Option<&'a str> {
    packument.get("dist-tags")?.get(tag)?.as_str()
}

/// The manifest of one version inside a packument.
#[must_use]
pub fn get_version_manifest<'a>(
    packument: &'a serde_json::Value,
    version: &str,
) -> Option<&'a serde_json::Value> {
    packument.get("versions")?.get(version)
}

/// Extract the tarball URL for a specific version.
#[must_use]
pub fn get_tarball_url<'a>(packument: &'a serde_json::Value, version: &str) -> Option<&'a str> {
    get_version_manifest(packument, version)?
        .get("dist")?
        .get("tarball")?
        .as_str()
}

/// Extract the SRI integrity string for a specific version.
#[must_use]
pub fn get_integrity(packument: &serde_json::Value, version: &str) -> Option<String> {
    let dist = get_version_manifest(packument, version)?.get("dist")?;
    if let Some(sri) = dist.get("integrity").and_then(|v| v.as_str()) {
        return Some(sri.to_string());
    }
    dist.get("shasum")
        .and_then(|v| v.as_str())
        .map(|sha| format!("sha1-{sha}"))
}

/// Get all available version strings from a packument.
#[must_use]
pub fn get_versions(packument: &serde_json::Value) -> Vec<&str> {
    packument
        .get("versions")
        .and_then(|v| v.as_object())
        .map(|obj| obj.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_dist_tag() {
        let packument = serde_json::json!({
            "name": "react",
            "dist-tags": {
                "latest": "18.2.0",
                "next": "19.0.0-rc.0"
            }
        });

        assert_eq!(get_dist_tag(&packument, "latest"), Some("18.2.0"));
        assert_eq!(get_dist_tag(&packument, "next"), Some("19.0.0-rc.0"));
        assert_eq!(get_dist_tag(&packument, "beta"), None);
    }

    #[test]
    fn test_get_tarball_url_and_integrity() {
        let packument = serde_json::json!({
            "name": "react",
            "versions": {
                "18.2.0": {
                    "dist": {
                        "tarball": "https://registry.npmjs.org/react/-/react-18.2.0.tgz",
                        "shasum": "abc123"
                    }
                }
            }
        });

        assert_eq!(
            get_tarball_url(&packument, "18.2.0"),
            Some("https://registry.npmjs.org/react/-/react-18.2.0.tgz")
        );
        assert_eq!(get_tarball_url(&packument, "17.0.0"), None);
        assert_eq!(
            get_integrity(&packument, "18.2.0").as_deref(),
            Some("sha1-abc123")
        );
    }

    #[test]
    fn test_default_tarball_url() {
        assert_eq!(
            default_tarball_url("https://registry.npmjs.org/", "left-pad", "1.3.0"),
            "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz"
        );
        assert_eq!(
            default_tarball_url("https://registry.npmjs.org/", "@types/node", "20.0.0"),
            "https://registry.npmjs.org/@types/node/-/node-20.0.0.tgz"
        );
    }

    #[test]
    fn test_encode_name() {
        assert_eq!(encode_name("react"), "react");
        assert_eq!(encode_name("@types/node"), "@types%2Fnode");
    }

    #[test]
    fn test_get_versions() {
        let packument = serde_json::json!({
            "name": "react",
            "versions": {
                "18.2.0": {},
                "18.1.0": {},
                "17.0.2": {}
            }
        });

        let versions = get_versions(&packument);
        assert_eq!(versions.len(), 3);
        assert!(versions.contains(&"18.1.0"));
    }

    #[test]
    fn test_client_creation() {
        assert!(RegistryClient::new(16).is_ok());
    }

    #[tokio::test]
    async fn test_fetch_invalid_registry_url() {
        let client = RegistryClient::new(1).unwrap();
        let err = client.fetch_packument("not-a-url", "react").await.unwrap_err();
        assert_eq!(err.code(), super::super::error::codes::PKG_REGISTRY_ERROR);
    }
}
