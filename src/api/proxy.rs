use std::io::Cursor;

use bytes::Bytes;
use log::{error, info};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use rocket::data::{Data, ToByteUnit};
use rocket::http::{Header, Status};
use rocket::outcome::Outcome;
use rocket::request::{self, FromRequest, Request};
use rocket::response::{self, Responder, Response};
use rocket::State;

use crate::api::target::TargetRequest;
use crate::api::ApiError;
use crate::transport::{policy, CachingTransport, OriginRequest, ProxyResponse};
use crate::whitelist::Whitelist;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Proxy plumbing, client credentials, and conditionals the proxy answers itself
const NOT_FORWARDED: [&str; 12] = [
    "host",
    "content-length",
    "via",
    "forwarded",
    "cookie",
    "authorization",
    "range",
    "if-range",
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
];

const FORWARDED_RESPONSE_HEADERS: [&str; 9] = [
    "content-type",
    "content-encoding",
    "content-language",
    "cache-control",
    "expires",
    "etag",
    "last-modified",
    "vary",
    "location",
];

/// Upper bound on request bodies forwarded for POST, PUT, PATCH and DELETE.
const MAX_FORWARD_BODY_MIB: u64 = 10;

/// The parts of an incoming request the proxy forwards.
#[derive(Debug)]
pub struct ClientRequest {
    pub raw_path: String,
    pub query: Option<String>,
    pub method: Method,
    pub headers: HeaderMap,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientRequest {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let uri = req.uri();
        let method = Method::from_bytes(req.method().as_str().as_bytes()).unwrap_or(Method::GET);

        Outcome::Success(ClientRequest {
            raw_path: uri.path().as_str().to_string(),
            query: uri.query().map(|q| q.as_str().to_string()),
            method,
            headers: forwardable_headers(req),
        })
    }
}

fn forwardable_headers(req: &Request<'_>) -> HeaderMap {
    let connection_tokens: Vec<String> = req
        .headers()
        .get("Connection")
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut headers = HeaderMap::new();
    for header in req.headers().iter() {
        let name = header.name().as_str().to_ascii_lowercase();
        if !is_forwardable(&name, &connection_tokens) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(header.value()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

fn is_forwardable(name: &str, connection_tokens: &[String]) -> bool {
    !(HOP_BY_HOP.contains(&name)
        || NOT_FORWARDED.contains(&name)
        || name.starts_with("proxy-")
        || name.starts_with("x-forwarded-")
        || connection_tokens.iter().any(|token| token == name))
}

// Response from the origin or the cache, with the client's own conditional
// request answered here
pub struct ProxyReply {
    pub response: ProxyResponse,
}

impl<'r> Responder<'r, 'static> for ProxyReply {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let response = self.response;

        let mut builder = Response::build();
        builder.header(Header::new("X-Cache", response.cache_status.as_str()));
        for name in FORWARDED_RESPONSE_HEADERS {
            if let Some(value) = policy::joined(&response.headers, name) {
                builder.header(Header::new(name, value));
            }
        }

        if response.status == StatusCode::OK && not_modified(req, &response.headers) {
            return builder.status(Status::NotModified).ok();
        }

        builder
            .status(Status::new(response.status.as_u16()))
            .sized_body(response.body.len(), Cursor::new(response.body))
            .ok()
    }
}

fn not_modified(req: &Request<'_>, headers: &HeaderMap) -> bool {
    if let Some(if_none_match) = req.headers().get_one("If-None-Match") {
        return policy::joined(headers, "etag")
            .map_or(false, |etag| etag_matches(if_none_match, &etag));
    }

    if let Some(since) = req.headers().get_one("If-Modified-Since") {
        let since = policy::http_date(since);
        let modified = policy::joined(headers, "last-modified").and_then(|lm| policy::http_date(&lm));
        if let (Some(since), Some(modified)) = (since, modified) {
            return modified <= since;
        }
    }

    false
}

// Weak comparison, as If-None-Match requires
fn etag_matches(candidates: &str, etag: &str) -> bool {
    let etag = etag.trim().trim_start_matches("W/");
    candidates.split(',').any(|candidate| {
        let candidate = candidate.trim();
        candidate == "*" || candidate.trim_start_matches("W/") == etag
    })
}

async fn forward(
    request: ClientRequest,
    body: Option<Bytes>,
    whitelist: &Whitelist,
    transport: &CachingTransport,
) -> Result<ProxyReply, ApiError> {
    let target = match TargetRequest::parse(&request.raw_path, request.query.as_deref(), request.method) {
        Ok(target) => target,
        Err(err) => {
            info!("Rejected request for {}: {}", request.raw_path, err);
            return Err(err.into());
        }
    };

    if !whitelist.permits(&target.target_url) {
        info!("Refused {}: host '{}' is not allowed", target.target_url, target.host());
        return Err(ApiError::Forbidden(target.host().to_string()));
    }

    // HEAD shares the GET entry; Rocket strips the body on the way out
    let method = if target.method == Method::HEAD {
        Method::GET
    } else {
        target.method.clone()
    };

    let origin_request = OriginRequest {
        method,
        url: target.target_url.clone(),
        headers: request.headers,
        body,
    };

    match transport.fetch(origin_request).await {
        Ok(response) => {
            info!(
                "{} {} -> {} ({})",
                target.method,
                target.target_url,
                response.status,
                response.cache_status.as_str()
            );
            Ok(ProxyReply { response })
        }
        Err(err) if err.is_blocked() => {
            info!("Refused {}: {}", target.target_url, err);
            Err(err.into())
        }
        Err(err) => {
            error!("Fetching {} failed: {}", target.target_url, err);
            Err(err.into())
        }
    }
}

async fn read_body(data: Data<'_>) -> Result<Bytes, ApiError> {
    let capped = data
        .open(MAX_FORWARD_BODY_MIB.mebibytes())
        .into_bytes()
        .await
        .map_err(|e| ApiError::Body(e.to_string()))?;
    if !capped.is_complete() {
        return Err(ApiError::BodyTooLarge);
    }
    Ok(Bytes::from(capped.into_inner()))
}

#[get("/<_..>")]
pub async fn proxy_get(
    request: ClientRequest,
    whitelist: &State<Whitelist>,
    transport: &State<CachingTransport>,
) -> Result<ProxyReply, ApiError> {
    forward(request, None, whitelist, transport).await
}

#[options("/<_..>")]
pub async fn proxy_options(
    request: ClientRequest,
    whitelist: &State<Whitelist>,
    transport: &State<CachingTransport>,
) -> Result<ProxyReply, ApiError> {
    forward(request, None, whitelist, transport).await
}

#[post("/<_..>", data = "<data>")]
pub async fn proxy_post(
    request: ClientRequest,
    data: Data<'_>,
    whitelist: &State<Whitelist>,
    transport: &State<CachingTransport>,
) -> Result<ProxyReply, ApiError> {
    let body = read_body(data).await?;
    forward(request, Some(body), whitelist, transport).await
}

#[put("/<_..>", data = "<data>")]
pub async fn proxy_put(
    request: ClientRequest,
    data: Data<'_>,
    whitelist: &State<Whitelist>,
    transport: &State<CachingTransport>,
) -> Result<ProxyReply, ApiError> {
    let body = read_body(data).await?;
    forward(request, Some(body), whitelist, transport).await
}

#[patch("/<_..>", data = "<data>")]
pub async fn proxy_patch(
    request: ClientRequest,
    data: Data<'_>,
    whitelist: &State<Whitelist>,
    transport: &State<CachingTransport>,
) -> Result<ProxyReply, ApiError> {
    let body = read_body(data).await?;
    forward(request, Some(body), whitelist, transport).await
}

#[delete("/<_..>", data = "<data>")]
pub async fn proxy_delete(
    request: ClientRequest,
    data: Data<'_>,
    whitelist: &State<Whitelist>,
    transport: &State<CachingTransport>,
) -> Result<ProxyReply, ApiError> {
    let body = read_body(data).await?;
    forward(request, Some(body), whitelist, transport).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_hop_by_hop_and_proxy_headers() {
        let tokens = vec!["x-trace".to_string()];
        assert!(is_forwardable("accept", &tokens));
        assert!(is_forwardable("user-agent", &tokens));
        assert!(!is_forwardable("connection", &tokens));
        assert!(!is_forwardable("x-trace", &tokens));
        assert!(!is_forwardable("x-forwarded-for", &tokens));
        assert!(!is_forwardable("proxy-connection", &tokens));
        assert!(!is_forwardable("cookie", &tokens));
        assert!(!is_forwardable("if-none-match", &tokens));
    }

    #[test]
    fn etag_comparison_is_weak() {
        assert!(etag_matches("\"abc\"", "\"abc\""));
        assert!(etag_matches("W/\"abc\"", "\"abc\""));
        assert!(etag_matches("\"x\", \"abc\"", "W/\"abc\""));
        assert!(etag_matches("*", "\"abc\""));
        assert!(!etag_matches("\"abd\"", "\"abc\""));
    }
}
