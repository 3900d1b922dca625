use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::HeaderMap;
use reqwest::{redirect, Client, Method, StatusCode};
use thiserror::Error;
use url::Url;

use crate::whitelist::{is_restricted, Whitelist};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Origin timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Invalid origin response: {0}")]
    Response(String),

    #[error("Body transfer failed: {0}")]
    Body(String),

    #[error("Host resolves only to restricted addresses: {0}")]
    Blocked(String),

    #[error("Request error: {0}")]
    Request(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout(_))
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, FetchError::Blocked(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        let detail = describe(&error);
        if let Some(restricted) = restricted_host(&error) {
            FetchError::Blocked(restricted.0.clone())
        } else if error.is_timeout() {
            FetchError::Timeout(detail)
        } else if error.is_connect() {
            FetchError::Connect(detail)
        } else if error.is_body() || error.is_decode() {
            FetchError::Body(detail)
        } else if error.is_builder() || error.is_request() {
            FetchError::Request(detail)
        } else {
            FetchError::Response(detail)
        }
    }
}

// reqwest's Display hides the underlying cause; operators want the whole chain
fn describe(error: &reqwest::Error) -> String {
    let mut detail = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}

// The resolver's refusal arrives wrapped by hyper and reqwest
fn restricted_host(error: &reqwest::Error) -> Option<&RestrictedHost> {
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(restricted) = cause.downcast_ref::<RestrictedHost>() {
            return Some(restricted);
        }
        if let Some(restricted) = cause
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
            .and_then(|inner| inner.downcast_ref::<RestrictedHost>())
        {
            return Some(restricted);
        }
        source = cause.source();
    }
    None
}

/// Outbound request to an origin server.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl OriginRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// Fully received origin response. A response only exists once its whole
/// body has arrived.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The HTTP transport wrapped by the caching layer.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn send(&self, request: OriginRequest) -> Result<OriginResponse, FetchError>;
}

/// Origin backed by a shared `reqwest` client.
///
/// Redirects are never followed: 3xx responses go back to the client, which
/// then asks the proxy for the new location and passes authorization again.
pub struct HttpOrigin {
    client: Client,
}

impl HttpOrigin {
    pub fn new(
        timeout: Duration,
        user_agent: &str,
        whitelist: Arc<Whitelist>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(redirect::Policy::none())
            .dns_resolver(Arc::new(GuardedResolver { whitelist }))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn send(&self, request: OriginRequest) -> Result<OriginResponse, FetchError> {
        log::debug!("{} {}", request.method, request.url);

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Error, Debug)]
#[error("{0} only resolves to restricted addresses")]
struct RestrictedHost(String);

// Drops loopback/private/link-local answers unless the host is listed exactly
struct GuardedResolver {
    whitelist: Arc<Whitelist>,
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let unrestricted = self.whitelist.may_reach_restricted(&host);
        Box::pin(resolve_permitted(host, unrestricted))
    }
}

async fn resolve_permitted(
    host: String,
    unrestricted: bool,
) -> Result<Addrs, Box<dyn StdError + Send + Sync>> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .collect();
    let permitted: Vec<SocketAddr> = resolved
        .into_iter()
        .filter(|addr| unrestricted || !is_restricted(addr.ip()))
        .collect();

    if permitted.is_empty() {
        log::warn!("Refusing to connect to {}: restricted address", host);
        return Err(Box::new(RestrictedHost(host)));
    }

    Ok(Box::new(permitted.into_iter()))
}
