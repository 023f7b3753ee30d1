//! Retrying HTTP transport used for every call the agent makes.
//!
//! Each logical request is attempted once plus up to
//! [`RetryPolicy::max_retries`] more times. A response of 200, 201 or 202 is
//! success; 410 ends the request immediately with [`TransportError::Gone`];
//! anything else is logged and retried after a fixed delay.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, error};

use crate::error::TransportError;

/// Value sent in `x-ms-agent-name`.
pub const AGENT_NAME: &str = "WALinuxAgent";
/// Value sent in `x-ms-version` on calls to the wire server.
pub const PROTOCOL_VERSION: &str = "2012-11-30";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// A URL split into the parts the agent cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidUrl(url.to_string());

        let (secure, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(invalid());
        };

        let (authority, path) = match rest.find(['/', '?']) {
            Some(idx) if rest.as_bytes()[idx] == b'?' => (&rest[..idx], format!("/{}", &rest[idx..])),
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };

        let default_port = if secure { 443 } else { 80 };
        let (host, port) = split_host_port(authority, default_port).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            path,
        })
    }

    pub fn origin(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.origin(), self.path)
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(&str, u16)> {
    // Bracketed IPv6 literal.
    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &authority[..close + 2];
        return match &rest[close + 1..] {
            "" => Some((host, default_port)),
            port => Some((host, port.strip_prefix(':')?.parse().ok()?)),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, port.parse().ok()?)),
        None => Some((authority, default_port)),
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn is_success(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200..=202)
}

/// HTTP client shared by every agent component.
pub struct TransportClient {
    direct: Client,
    proxied: Option<Client>,
    policy: RetryPolicy,
    base: Option<Endpoint>,
}

impl TransportClient {
    pub fn new(policy: RetryPolicy, proxy: Option<ProxyConfig>) -> Result<Self, TransportError> {
        let direct = Client::builder().no_proxy().build()?;
        let proxied = match proxy {
            Some(proxy) => Some(
                Client::builder()
                    .proxy(reqwest::Proxy::all(proxy.url())?)
                    .build()?,
            ),
            None => None,
        };

        Ok(Self {
            direct,
            proxied,
            policy,
            base: None,
        })
    }

    /// Resolve relative paths (`/machine/...`) against `url`.
    pub fn with_base_endpoint(mut self, url: &str) -> Result<Self, TransportError> {
        self.base = Some(Endpoint::parse(url)?);
        Ok(self)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn resolve(&self, url: &str) -> Result<String, TransportError> {
        if url.starts_with('/') {
            return match &self.base {
                Some(base) => Ok(format!("{}{}", base.origin(), url)),
                None => Err(TransportError::InvalidUrl(url.to_string())),
            };
        }
        Ok(Endpoint::parse(url)?.url())
    }

    /// Issue `method url` with retries.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        headers: &[(&str, String)],
        use_proxy: bool,
    ) -> Result<HttpResponse, TransportError> {
        let target = self.resolve(url)?;
        let client = match (&self.proxied, use_proxy) {
            (Some(proxied), true) => proxied,
            _ => &self.direct,
        };

        let attempts = self.policy.max_retries + 1;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.policy.retry_delay).await;
            }

            match self.attempt(client, &method, &target, body, headers).await {
                Ok(resp) if is_success(resp.status) => {
                    debug!(method = %method, url = %target, status = %resp.status, "HTTP request succeeded");
                    return Ok(resp);
                }
                Ok(resp) if resp.status == StatusCode::GONE => {
                    return Err(TransportError::Gone {
                        method: method.to_string(),
                        url: target,
                    });
                }
                Ok(resp) => {
                    error!(
                        retry = attempt,
                        method = %method,
                        url = %target,
                        body_len = body.map_or(0, <[u8]>::len),
                        request_headers = ?headers,
                        status = resp.status.as_u16(),
                        reason = resp.status.canonical_reason().unwrap_or(""),
                        response_headers = ?resp.headers,
                        response_body = %resp.text(),
                        "HTTP request failed"
                    );
                }
                Err(e) => {
                    error!(
                        retry = attempt,
                        method = %method,
                        url = %target,
                        body_len = body.map_or(0, <[u8]>::len),
                        request_headers = ?headers,
                        error = %e,
                        "HTTP request failed: response is empty"
                    );
                }
            }
        }

        Err(TransportError::Exhausted {
            method: method.to_string(),
            url: target,
            attempts,
        })
    }

    async fn attempt(
        &self,
        client: &Client,
        method: &Method,
        url: &str,
        body: Option<&[u8]>,
        headers: &[(&str, String)],
    ) -> Result<HttpResponse, reqwest::Error> {
        let mut builder = client
            .request(method.clone(), url)
            .timeout(self.policy.request_timeout);
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body.to_vec());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, String)],
        use_proxy: bool,
    ) -> Result<HttpResponse, TransportError> {
        self.request(Method::GET, url, None, headers, use_proxy).await
    }

    pub async fn head(
        &self,
        url: &str,
        headers: &[(&str, String)],
        use_proxy: bool,
    ) -> Result<HttpResponse, TransportError> {
        self.request(Method::HEAD, url, None, headers, use_proxy).await
    }

    pub async fn put(
        &self,
        url: &str,
        body: &[u8],
        headers: &[(&str, String)],
        use_proxy: bool,
    ) -> Result<HttpResponse, TransportError> {
        self.request(Method::PUT, url, Some(body), headers, use_proxy)
            .await
    }

    pub async fn post(
        &self,
        url: &str,
        body: &[u8],
        headers: &[(&str, String)],
        use_proxy: bool,
    ) -> Result<HttpResponse, TransportError> {
        self.request(Method::POST, url, Some(body), headers, use_proxy)
            .await
    }

    pub async fn delete(
        &self,
        url: &str,
        headers: &[(&str, String)],
        use_proxy: bool,
    ) -> Result<HttpResponse, TransportError> {
        self.request(Method::DELETE, url, None, headers, use_proxy)
            .await
    }

    /// GET with the agent identification headers.
    pub async fn get_with_agent_headers(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.get(url, &agent_headers(), false).await
    }

    /// POST an XML document with the agent identification headers.
    ///
    /// A 410 is logged and returned as a failure like any other; callers
    /// see `Gone` only through the error value.
    pub async fn post_with_agent_headers(
        &self,
        url: &str,
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        let mut headers = agent_headers();
        headers.push(("Content-Type", "text/xml; charset=utf-8".to_string()));
        let result = self.post(url, body, &headers, false).await;
        if let Err(e @ TransportError::Gone { .. }) = &result {
            error!(error = %e, "POST rejected as gone");
        }
        result
    }
}

fn agent_headers() -> Vec<(&'static str, String)> {
    vec![
        ("x-ms-agent-name", AGENT_NAME.to_string()),
        ("x-ms-version", PROTOCOL_VERSION.to_string()),
    ]
}
