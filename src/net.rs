//! Outbound HTTP for block explorers and price sources
//!
//! Every request has a hard timeout so a stalled source cannot hold a worker.
//! With `use_tor` all traffic goes through the Tor SOCKS5 proxy and hostnames
//! are resolved by Tor (`socks5h`).

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NetConfig;
use crate::{PayError, PayResult};

/// Shared HTTP client
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
    use_tor: bool,
}

impl HttpClient {
    /// Build a client from the network configuration
    pub fn new(config: &NetConfig) -> PayResult<Self> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; rv:102.0) Gecko/20100101 Firefox/102.0");

        if config.use_tor {
            let proxy_url = format!(
                "socks5h://{}:{}",
                config.tor_socks5_host, config.tor_socks5_port
            );
            let proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| PayError::Configuration(format!("Invalid Tor proxy {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| PayError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            use_tor: config.use_tor,
        })
    }

    /// Whether requests are routed through Tor
    pub fn uses_tor(&self) -> bool {
        self.use_tor
    }

    async fn get(&self, url: &str) -> PayResult<reqwest::Response> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PayError::Transient(format!("GET {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(PayError::Transient(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }

    /// GET a plain text body
    pub async fn get_text(&self, url: &str) -> PayResult<String> {
        let response = self.get(url).await?;
        response
            .text()
            .await
            .map_err(|e| PayError::Transient(format!("Failed to read {}: {}", url, e)))
    }

    /// GET and decode a JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> PayResult<T> {
        let response = self.get(url).await?;
        response.json::<T>().await.map_err(|e| {
            warn!("Failed to parse response from {}: {}", url, e);
            PayError::Transient(format!("Failed to parse {}: {}", url, e))
        })
    }
}

/// Exact decimal from a JSON number or numeric string
///
/// serde_json keeps the original digits of numbers, so no float rounding
/// happens on the way.
pub fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    let text = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}
