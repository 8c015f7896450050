//! Outbound HTTP client construction, honoring a dynamically configured
//! proxy and producing browser-fingerprinted sessions for the solver.

use std::sync::Arc;
use std::time::Duration;

use fake_user_agent::get_chrome_rua;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, UPGRADE_INSECURE_REQUESTS,
    USER_AGENT,
};
use thiserror::Error;

use crate::settings::{SettingsStore, StoreError};

const PROXY_SETTING_KEY: &str = "network.proxy_url";

#[derive(Debug, Error)]
pub enum NetError {
    #[error("building http client: {0}")]
    Build(#[from] reqwest::Error),
    #[error("settings store: {0}")]
    Store(#[from] StoreError),
}

/// Capability returning the currently-configured outbound proxy URL. An
/// empty string (or `None`) means direct connections.
pub trait ProxyProvider: Send + Sync {
    fn proxy_url(&self) -> Result<Option<String>, NetError>;
}

/// Reads the proxy URL from the shared settings store under a reserved key.
pub struct SettingsProxyProvider {
    store: Arc<dyn SettingsStore>,
}

impl SettingsProxyProvider {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }
}

impl ProxyProvider for SettingsProxyProvider {
    fn proxy_url(&self) -> Result<Option<String>, NetError> {
        let value = self.store.get(PROXY_SETTING_KEY)?;
        Ok(value.filter(|v| !v.is_empty()))
    }
}

/// Always-direct provider; used by the factory's test-mode constructor.
pub struct NoProxyProvider;

impl ProxyProvider for NoProxyProvider {
    fn proxy_url(&self) -> Result<Option<String>, NetError> {
        Ok(None)
    }
}

/// Builds outbound HTTP clients. Every client this factory hands out
/// consults `proxy` at build time, so a proxy change takes effect on the
/// next client built (not retroactively on long-lived clients).
pub struct NetworkClientFactory {
    proxy: Arc<dyn ProxyProvider>,
}

impl NetworkClientFactory {
    pub fn new(proxy: Arc<dyn ProxyProvider>) -> Self {
        Self { proxy }
    }

    /// Constructor that bypasses proxy lookup entirely, for tests.
    pub fn test_mode() -> Self {
        Self { proxy: Arc::new(NoProxyProvider) }
    }

    fn apply_proxy(&self, mut builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder, NetError> {
        if let Some(url) = self.proxy.proxy_url()? {
            builder = builder.proxy(reqwest::Proxy::all(&url)?);
        }
        Ok(builder)
    }

    /// A plain client with no default headers and redirects followed,
    /// suitable for generic feed fetches.
    pub fn plain_client(&self, timeout: Duration) -> Result<reqwest::Client, NetError> {
        let builder = reqwest::Client::builder().timeout(timeout);
        Ok(self.apply_proxy(builder)?.build()?)
    }

    /// A client carrying a Chrome-like header set and cookie jar, used when
    /// talking to hosts that may be sitting behind a bot-protection gateway.
    pub fn browser_session(
        &self,
        jar: Arc<reqwest::cookie::Jar>,
        timeout: Duration,
        follow_redirects: bool,
    ) -> Result<reqwest::Client, NetError> {
        let mut builder = reqwest::Client::builder()
            .default_headers(default_chrome_headers())
            .cookie_provider(jar)
            .timeout(timeout);
        if !follow_redirects {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }
        Ok(self.apply_proxy(builder)?.build()?)
    }

    /// Performs a single GET against `test_url` and reports reachability.
    /// Any HTTP status (even 4xx/5xx) counts as reachable; only transport or
    /// request-build failures are errors.
    pub async fn test_proxy(&self, test_url: &str) -> Result<(), NetError> {
        let client = self.plain_client(Duration::from_secs(10))?;
        client.get(test_url).send().await?;
        Ok(())
    }
}

/// The ordered Chrome-like header set the teacher's CLI hand-assembled in
/// `main`; generalized here into a reusable builder.
pub fn default_chrome_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let user_agent = get_chrome_rua();
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(r#""Not/A)Brand";v="8", "Chromium";v="126", "Google Chrome";v="126""#),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Linux\""));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
        ),
    );
    headers.insert("sec-fetch-site", HeaderValue::from_static("none"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("priority", HeaderValue::from_static("u=0, i"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}
