use reqwest::Method;
use rocket::http::RawStr;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TargetError {
    #[error("no target URL in request path")]
    Missing,

    #[error("target is not an absolute URL: {0}")]
    Invalid(String),

    #[error("scheme '{0}' is not allowed, use http or https")]
    Scheme(String),

    #[error("target URL has no host")]
    NoHost,

    #[error("target URL must not carry credentials")]
    Credentials,
}

/// The remote resource a client asked for, parsed from `/<remote-url>`.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRequest {
    pub raw_path: String,
    pub target_url: Url,
    pub method: Method,
}

impl TargetRequest {
    /// Parses the raw (still percent-encoded) request path and query.
    ///
    /// The query string of the incoming request belongs to the remote URL.
    pub fn parse(raw_path: &str, query: Option<&str>, method: Method) -> Result<Self, TargetError> {
        let target = target_string(raw_path, query)?;
        let target_url = Url::parse(&target).map_err(|e| TargetError::Invalid(e.to_string()))?;

        match target_url.scheme() {
            "http" | "https" => {}
            other => return Err(TargetError::Scheme(other.to_string())),
        }
        if target_url.host_str().map_or(true, str::is_empty) {
            return Err(TargetError::NoHost);
        }
        if !target_url.username().is_empty() || target_url.password().is_some() {
            return Err(TargetError::Credentials);
        }

        Ok(Self {
            raw_path: raw_path.to_string(),
            target_url,
            method,
        })
    }

    pub fn host(&self) -> &str {
        self.target_url.host_str().unwrap_or_default()
    }
}

fn target_string(raw_path: &str, query: Option<&str>) -> Result<String, TargetError> {
    let trimmed = raw_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(TargetError::Missing);
    }

    // "/http%3A%2F%2Fhost%2Fa.png" carries the whole URL percent-encoded
    let mut target = if trimmed.contains(":/") {
        trimmed.to_string()
    } else {
        RawStr::new(trimmed)
            .percent_decode()
            .map_err(|e| TargetError::Invalid(e.to_string()))?
            .into_owned()
    };

    // Some intermediaries collapse "//" in paths: "http:/host/a.png"
    for scheme in ["http:/", "https:/"] {
        let collapsed = target
            .get(..scheme.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(scheme))
            && target.as_bytes().get(scheme.len()).map_or(false, |b| *b != b'/');
        if collapsed {
            target.insert(scheme.len(), '/');
            break;
        }
    }

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }

    Ok(target)
}
