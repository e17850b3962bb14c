//! HTTP unit for REST API calls
//!
//! This module provides HTTP/HTTPS request execution with the following features:
//! - **Methods:** GET, POST, PUT, DELETE
//! - **Request bodies:** JSON from the task params
//! - **Custom headers:** User-defined headers for authentication, content-type, etc.
//! - **Configurable timeouts:** Per-request timeout enforcement
//! - **Status code handling:** 2xx = success, anything else = failure
//!
//! # Security
//!
//! - TLS/SSL verification enabled by default
//! - Requests to private, loopback, link-local and metadata addresses are
//!   refused unless `allow_private_ips` is set
//! - Response body size limit (MAX_RESPONSE_SIZE)
//!
//! # Example
//!
//! ```yaml
//! - name: notify
//!   unit: http
//!   params:
//!     url: https://hooks.example.com/done
//!     method: POST
//!     body: { status: done }
//!     timeout: 10
//! ```

use crate::error::{Result, TributaryError};
use crate::models::{HttpConfig, HttpMethod, MAX_RESPONSE_SIZE};
use crate::units::{Invocable, TaskContext, UnitError};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Host;

/// HTTP unit for REST API calls
#[derive(Debug, Clone)]
pub struct HttpUnit {
    /// Reqwest client with connection pooling
    client: Client,
}

impl HttpUnit {
    /// Create a new HTTP unit
    ///
    /// # Errors
    ///
    /// Returns `Infrastructure` when the TLS backend cannot be initialized.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("Tributary/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                TributaryError::Infrastructure(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }

    /// Validate URL for SSRF (Server-Side Request Forgery) protection
    ///
    /// Blocks private ranges, loopback, link-local and cloud metadata
    /// endpoints unless `allow_private_ips` is set.
    fn validate_ssrf(url: &str, allow_private_ips: bool) -> Result<()> {
        let parsed_url = reqwest::Url::parse(url)
            .map_err(|e| TributaryError::Validation(format!("Invalid URL: {}", e)))?;

        let scheme = parsed_url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(TributaryError::Validation(format!(
                "Invalid URL scheme '{}': only http and https are allowed",
                scheme
            )));
        }

        let host = parsed_url
            .host()
            .ok_or_else(|| TributaryError::Validation("URL must contain a host".to_string()))?;

        if allow_private_ips {
            return Ok(());
        }

        match host {
            Host::Ipv4(ip) => Self::validate_ipv4_not_private(ip),
            Host::Ipv6(ip) => Self::validate_ipv6_not_private(ip),
            Host::Domain(domain) => Self::validate_domain_not_blocked(domain),
        }
    }

    fn validate_ipv4_not_private(ip: Ipv4Addr) -> Result<()> {
        let reason = if ip.is_private() {
            Some("private IP addresses")
        } else if ip.is_loopback() {
            Some("loopback addresses")
        } else if ip.is_link_local() {
            // Includes the 169.254.169.254 metadata endpoint
            Some("link-local addresses")
        } else if ip.is_unspecified() {
            Some("unspecified addresses")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(TributaryError::Validation(format!(
                "SSRF protection: requests to {} are blocked ({})",
                reason, ip
            ))),
            None => Ok(()),
        }
    }

    fn validate_ipv6_not_private(ip: Ipv6Addr) -> Result<()> {
        let blocked = ip.is_loopback()
            || ip.is_unspecified()
            || ip.is_unicast_link_local()
            // unique local fc00::/7
            || (ip.segments()[0] & 0xfe00) == 0xfc00;

        if blocked {
            return Err(TributaryError::Validation(format!(
                "SSRF protection: requests to non-public IPv6 addresses are blocked ({})",
                ip
            )));
        }
        Ok(())
    }

    fn validate_domain_not_blocked(domain: &str) -> Result<()> {
        let blocked_domains = [
            "localhost",
            "metadata.google.internal",
            "metadata",
            "instance-data",
        ];

        let domain_lower = domain.to_lowercase();

        for blocked in &blocked_domains {
            if domain_lower == *blocked || domain_lower.ends_with(&format!(".{}", blocked)) {
                return Err(TributaryError::Validation(format!(
                    "SSRF protection: requests to '{}' are blocked (metadata service or localhost)",
                    domain
                )));
            }
        }

        Ok(())
    }

    /// Validate HTTP configuration
    fn validate_config(config: &HttpConfig) -> Result<()> {
        if config.url.is_empty() {
            return Err(TributaryError::Validation(
                "HTTP URL cannot be empty".to_string(),
            ));
        }

        Self::validate_ssrf(&config.url, config.allow_private_ips)?;

        if config.timeout == 0 || config.timeout > 3600 {
            return Err(TributaryError::Validation(format!(
                "HTTP timeout must be between 1 and 3600 seconds, got: {}",
                config.timeout
            )));
        }

        if config.allow_private_ips {
            warn!(
                "SECURITY WARNING: allow_private_ips is enabled for URL {} - SSRF protection disabled",
                config.url
            );
        }

        Ok(())
    }

    fn parse_params(params: &Value) -> std::result::Result<HttpConfig, UnitError> {
        let config: HttpConfig = serde_json::from_value(params.clone())
            .map_err(|e| UnitError::InvalidParams(e.to_string()))?;
        Self::validate_config(&config).map_err(|e| UnitError::InvalidParams(e.to_string()))?;
        Ok(config)
    }

    fn convert_method(method: &HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    /// Describe a transport error for the instance's `last_error`
    fn classify(err: &reqwest::Error, timeout_secs: u64) -> String {
        if err.is_timeout() {
            format!("Request timed out after {} seconds", timeout_secs)
        } else if err.is_connect() {
            format!("Connection failed: {}", err)
        } else if err.is_request() {
            format!("Invalid request: {}", err)
        } else {
            format!("Request failed: {}", err)
        }
    }
}

#[async_trait]
impl Invocable for HttpUnit {
    /// Output value: `{"status": 200, "body": <json or string>, "truncated": false}`
    async fn invoke(&self, ctx: &TaskContext) -> std::result::Result<Value, UnitError> {
        let config = Self::parse_params(&ctx.params)?;

        info!(
            "Executing HTTP {:?} request to {} for {}.{}",
            config.method, config.url, ctx.workflow, ctx.task_id
        );

        let mut request = self
            .client
            .request(Self::convert_method(&config.method), &config.url)
            .timeout(Duration::from_secs(config.timeout))
            .header("X-Tributary-Run-Id", ctx.run_id.to_string())
            .header("X-Tributary-Task-Id", ctx.task_id.as_str())
            .header("X-Tributary-Attempt", ctx.attempt.to_string());

        for (key, value) in &config.headers {
            request = request.header(key, value);
        }

        if let Some(body) = &config.body {
            debug!("Request body: {}", body);
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UnitError::Http(Self::classify(&e, config.timeout)))?;

        let status = response.status();
        info!("HTTP request completed with status code: {}", status.as_u16());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| UnitError::Http(format!("Failed to read response body: {}", e)))?;

        let truncated = bytes.len() > MAX_RESPONSE_SIZE;
        let body_bytes = if truncated {
            warn!(
                "Response body truncated from {} to {} bytes",
                bytes.len(),
                MAX_RESPONSE_SIZE
            );
            &bytes[..MAX_RESPONSE_SIZE]
        } else {
            &bytes[..]
        };

        let text = String::from_utf8_lossy(body_bytes).to_string();

        if !status.is_success() {
            return Err(UnitError::Http(format!(
                "Request failed with status code {}: {}",
                status.as_u16(),
                text.chars().take(512).collect::<String>()
            )));
        }

        let body = if truncated {
            Value::String(text)
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(json!({
            "status": status.as_u16(),
            "body": body,
            "truncated": truncated,
        }))
    }

    fn validate(&self, params: &Value) -> std::result::Result<(), String> {
        Self::parse_params(params)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(url: &str) -> HttpConfig {
        HttpConfig {
            url: url.to_string(),
            method: HttpMethod::Get,
            body: None,
            headers: HashMap::new(),
            timeout: 30,
            allow_private_ips: false,
        }
    }

    #[test]
    fn test_validate_config_empty_url() {
        let result = HttpUnit::validate_config(&config(""));
        assert!(matches!(result, Err(TributaryError::Validation(_))));
    }

    #[test]
    fn test_validate_config_invalid_url() {
        assert!(HttpUnit::validate_config(&config("not a valid url")).is_err());
        assert!(HttpUnit::validate_config(&config("ftp://example.com/file")).is_err());
    }

    #[test]
    fn test_validate_config_invalid_timeout() {
        let mut cfg = config("https://example.com");
        cfg.timeout = 0;
        assert!(HttpUnit::validate_config(&cfg).is_err());

        cfg.timeout = 4000;
        assert!(HttpUnit::validate_config(&cfg).is_err());
    }

    #[test]
    fn test_ssrf_protection() {
        for url in [
            "http://10.0.0.1/",
            "http://172.16.0.1/",
            "http://192.168.1.1/",
            "http://127.0.0.1/",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]/",
            "http://localhost:8080/",
            "http://metadata.google.internal/",
        ] {
            assert!(
                HttpUnit::validate_config(&config(url)).is_err(),
                "Should block: {}",
                url
            );
        }
    }

    #[test]
    fn test_ssrf_protection_allow_private_ips() {
        let mut cfg = config("http://192.168.1.1/");
        cfg.allow_private_ips = true;
        assert!(HttpUnit::validate_config(&cfg).is_ok());
    }

    #[test]
    fn test_public_urls_allowed() {
        for url in ["https://api.github.com/", "http://example.com/"] {
            assert!(
                HttpUnit::validate_config(&config(url)).is_ok(),
                "Should allow public URL: {}",
                url
            );
        }
    }

    #[test]
    fn test_validate_params() {
        let unit = HttpUnit::new().unwrap();
        assert!(unit
            .validate(&json!({"url": "https://example.com", "method": "POST"}))
            .is_ok());
        assert!(unit.validate(&json!({"method": "GET"})).is_err());
        assert!(unit
            .validate(&json!({"url": "https://example.com", "method": "PATCH"}))
            .is_err());
    }

    #[test]
    fn test_convert_method() {
        assert_eq!(HttpUnit::convert_method(&HttpMethod::Get), Method::GET);
        assert_eq!(HttpUnit::convert_method(&HttpMethod::Delete), Method::DELETE);
    }
}
