//! HTTP sessions routed through one instance
//!
//! A [`TorSession`] is a `reqwest` client whose HTTP and HTTPS traffic goes
//! through an instance's SOCKS5 endpoint, with a user agent picked fresh for
//! every session.

use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::{PoolError, Result};
use crate::instance::InstanceSpec;

/// Supplies user-agent strings
pub trait UserAgentSource: Send + Sync {
    fn next_user_agent(&self) -> String;
}

/// Picks uniformly from a fixed list of common desktop browsers
#[derive(Debug, Clone)]
pub struct RandomUserAgent {
    agents: Vec<String>,
}

const BUILTIN_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

impl Default for RandomUserAgent {
    fn default() -> Self {
        Self::new(BUILTIN_USER_AGENTS.iter().map(|s| s.to_string()).collect())
    }
}

impl RandomUserAgent {
    /// Pick from `agents`; an empty list falls back to the built-in one
    pub fn new(agents: Vec<String>) -> Self {
        if agents.is_empty() {
            return Self::default();
        }
        Self { agents }
    }
}

impl UserAgentSource for RandomUserAgent {
    fn next_user_agent(&self) -> String {
        self.agents
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }
}

/// HTTP client bound to one instance
#[derive(Debug, Clone)]
pub struct TorSession {
    index: usize,
    proxy_url: String,
    user_agent: String,
    client: reqwest::Client,
}

impl TorSession {
    /// Build a client whose traffic goes through `spec`'s SOCKS endpoint
    pub fn new(spec: &InstanceSpec, user_agent: String) -> Result<Self> {
        let proxy_url = spec.proxy_url();
        let proxy = reqwest::Proxy::all(&proxy_url)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent)
                .map_err(|e| PoolError::Request(format!("invalid user agent: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            index: spec.index,
            proxy_url,
            user_agent,
            client,
        })
    }

    /// Instance this session routes through
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn proxy_url(&self) -> &str {
        &self.proxy_url
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Start a GET request through the proxy
    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.get(url)
    }

    /// Start a POST request through the proxy
    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.post(url)
    }
}
