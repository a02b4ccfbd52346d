use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::config::SourceConfig;
use crate::error::{Result, SwgraphError};
use crate::graph::{as_document, Document};

/// Remote document source: resolves a natural key to its JSON document.
///
/// Implementations report transport problems as `SwgraphError::Fetch` (with
/// the HTTP status when one was received) and unusable payloads as
/// `SwgraphError::MalformedDocument`. Retrying is the caller's job.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Document>;
}

/// Longest slice of an error body kept in error messages
const MAX_ERROR_BODY: usize = 200;

/// reqwest-backed source for the Star Wars API
pub struct HttpSource {
    client: Client,
    base_url: Url,
}

impl HttpSource {
    /// Create a source rooted at `base_url`.
    ///
    /// Relative keys such as `people/1` are resolved against it; absolute
    /// keys are fetched as-is.
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| SwgraphError::Config(format!("invalid base URL {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| SwgraphError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            Duration::from_secs(config.timeout_secs),
            &config.user_agent,
        )
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL fetched for `key`. The API serves resources with a trailing slash.
    pub fn resolve_url(&self, key: &str) -> Result<Url> {
        let key = key.trim();
        let mut url = if key.starts_with("http://") || key.starts_with("https://") {
            Url::parse(key)
        } else {
            self.base_url.join(key.trim_start_matches('/'))
        }
        .map_err(|e| SwgraphError::InvalidInput(format!("cannot resolve key {}: {}", key, e)))?;

        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}

#[async_trait]
impl DocumentSource for HttpSource {
    async fn fetch(&self, key: &str) -> Result<Document> {
        let url = self.resolve_url(key)?;
        let start = std::time::Instant::now();

        let response = self
            .client
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| SwgraphError::network(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(SwgraphError::Fetch {
                status: Some(status.as_u16()),
                message: format!("GET {}: {}", url, body),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| SwgraphError::network(format!("reading body of {}: {}", url, e)))?;
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| SwgraphError::MalformedDocument(format!("{} is not JSON: {}", url, e)))?;

        log::debug!("GET {} ({} bytes) in {:?}", url, body.len(), start.elapsed());
        as_document(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(base: &str) -> HttpSource {
        HttpSource::new(base, Duration::from_secs(5), "swgraph-test").unwrap()
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let s = source("https://swapi.dev/api");
        assert_eq!(s.base_url().as_str(), "https://swapi.dev/api/");
    }

    #[test]
    fn test_resolve_relative_key() {
        let s = source("https://swapi.dev/api/");
        assert_eq!(s.resolve_url("people/1").unwrap().as_str(), "https://swapi.dev/api/people/1/");
        assert_eq!(s.resolve_url("/films/2").unwrap().as_str(), "https://swapi.dev/api/films/2/");
    }

    #[test]
    fn test_resolve_absolute_key() {
        let s = source("https://swapi.dev/api/");
        assert_eq!(
            s.resolve_url("https://swapi.dev/api/planets/1").unwrap().as_str(),
            "https://swapi.dev/api/planets/1/"
        );
        assert_eq!(
            s.resolve_url("http://mirror.local/api/planets/1/").unwrap().as_str(),
            "http://mirror.local/api/planets/1/"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpSource::new("not a url", Duration::from_secs(5), "ua");
        assert!(matches!(result, Err(SwgraphError::Config(_))));
    }

    #[test]
    fn test_from_config_defaults() {
        let s = HttpSource::from_config(&SourceConfig::default()).unwrap();
        assert_eq!(s.base_url().as_str(), "https://swapi.dev/api/");
    }
}
