use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use crate::error::{Result, UpdaterError};
use crate::manifest::{
    parse_component, parse_repository, validate_component_id, ComponentManifest, Repository,
    COMPONENT_MANIFEST, REPOSITORY_INDEX,
};

/// Abstraction over fetching documents and archives from the repository.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the body at `url`. Transport errors, timeouts and non-success
    /// statuses all surface as [`UpdaterError::Fetch`].
    async fn fetch_bytes(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>>;
}

/// Builder for [`HttpFetcher`].
#[derive(Default)]
pub struct HttpFetcherBuilder {
    client: Option<Client>,
}

impl HttpFetcherBuilder {
    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the fetcher.
    pub fn build(self) -> HttpFetcher {
        HttpFetcher {
            client: self.client.unwrap_or_default(),
        }
    }
}

/// Plain HTTP(S) fetcher.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new builder.
    pub fn builder() -> HttpFetcherBuilder {
        HttpFetcherBuilder::default()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>> {
        let fetch_error = |err: reqwest::Error| UpdaterError::Fetch {
            url: url.to_string(),
            reason: if err.is_timeout() {
                format!("timed out after {timeout:?}")
            } else {
                err.to_string()
            },
        };

        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(fetch_error)?
            .error_for_status()
            .map_err(fetch_error)?;
        let bytes = response.bytes().await.map_err(fetch_error)?;
        Ok(bytes.to_vec())
    }
}

/// Typed access to one repository's manifests.
#[derive(Clone)]
pub struct RepositoryClient {
    base: Url,
    fetcher: Arc<dyn Fetcher>,
    timeout: Duration,
}

impl RepositoryClient {
    /// `base_url` is the directory holding `repository.json`.
    pub fn new(base_url: &str, fetcher: Arc<dyn Fetcher>, timeout: Duration) -> Result<Self> {
        let trimmed = base_url.trim_end_matches('/');
        let base = Url::parse(&format!("{trimmed}/")).map_err(|err| {
            UpdaterError::InvalidConfig(format!("invalid base URL '{base_url}': {err}"))
        })?;
        Ok(Self {
            base,
            fetcher,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn repository_url(&self) -> Result<Url> {
        self.join(REPOSITORY_INDEX)
    }

    pub fn component_url(&self, component_id: &str) -> Result<Url> {
        validate_component_id(component_id)?;
        self.join(&format!("{component_id}/{COMPONENT_MANIFEST}"))
    }

    /// Download and parse the repository index.
    pub async fn fetch_repository(&self) -> Result<Repository> {
        let url = self.repository_url()?;
        debug!(target: "updater", %url, "fetching repository index");
        let bytes = self.fetcher.fetch_bytes(&url, self.timeout).await?;
        parse_repository(&bytes)
    }

    /// Download and parse one component manifest.
    pub async fn fetch_component(&self, component_id: &str) -> Result<ComponentManifest> {
        let url = self.component_url(component_id)?;
        debug!(target: "updater", component = component_id, %url, "fetching component manifest");
        let bytes = self.fetcher.fetch_bytes(&url, self.timeout).await?;
        parse_component(&bytes)
    }

    /// Fetch an arbitrary page as UTF-8 text (release notes).
    pub async fn fetch_text(&self, url: &Url) -> Result<String> {
        let bytes = self.fetcher.fetch_bytes(url, self.timeout).await?;
        String::from_utf8(bytes).map_err(|err| UpdaterError::Fetch {
            url: url.to_string(),
            reason: format!("body is not UTF-8: {err}"),
        })
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|err| {
            UpdaterError::InvalidConfig(format!("invalid repository path '{path}': {err}"))
        })
    }
}
