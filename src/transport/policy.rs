//! HTTP caching rules: `Cache-Control` parsing, freshness, storability,
//! validators and `Vary` matching for a shared cache.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::Method;
use url::Url;

use crate::cache::CacheEntry;

/// Request headers whose values select a different representation, and so
/// become part of the cache key.
pub const KEY_HEADERS: [&str; 2] = ["accept", "accept-encoding"];

// Statuses a shared cache may store without explicit freshness information
const STORABLE_STATUSES: [u16; 11] = [200, 203, 204, 300, 301, 308, 404, 405, 410, 414, 501];

// Never copied from a 304 onto the stored entry
// RFC 850 ("Sunday, 06-Nov-94 08:49:37 GMT") and asctime ("Sun Nov  6 08:49:37 1994")
const OBSOLETE_DATE_FORMATS: [&str; 2] = ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"];

/// Cap for delta-seconds values from origin headers (2^31).
const MAX_DELTA_SECONDS: i64 = 2_147_483_648;

const NOT_MODIFIED_SKIP: [&str; 4] = ["content-length", "transfer-encoding", "connection", "keep-alive"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

/// Parsed `Cache-Control` directives, request or response side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub min_fresh: Option<u64>,
    /// `max-stale` without a value is stored as `u64::MAX`.
    pub max_stale: Option<u64>,
    pub stale_if_error: Option<u64>,
    pub no_cache: bool,
    pub no_store: bool,
    pub private: bool,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
}

impl CacheControl {
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();

        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            let (name, argument) = match directive.split_once('=') {
                Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                None => (directive.as_str(), None),
            };
            let seconds = argument.and_then(|a| a.parse::<u64>().ok());

            match name {
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "private" => cc.private = true,
                "must-revalidate" => cc.must_revalidate = true,
                "proxy-revalidate" => cc.proxy_revalidate = true,
                "max-age" => cc.max_age = seconds,
                "s-maxage" => cc.s_maxage = seconds,
                "min-fresh" => cc.min_fresh = seconds,
                "max-stale" => cc.max_stale = Some(seconds.unwrap_or(u64::MAX)),
                "stale-if-error" => cc.stale_if_error = seconds,
                _ => {}
            }
        }

        cc
    }

    fn of_entry(headers: &BTreeMap<String, String>) -> Self {
        headers
            .get("cache-control")
            .map(|value| Self::parse(value))
            .unwrap_or_default()
    }

    fn revalidation_required(&self) -> bool {
        self.must_revalidate || self.proxy_revalidate || self.s_maxage.is_some()
    }
}

/// Directives a client attached to its request. `Pragma: no-cache` counts as
/// `Cache-Control: no-cache`.
pub fn request_directives(headers: &HeaderMap) -> CacheControl {
    let mut cc = joined(headers, "cache-control")
        .map(|value| CacheControl::parse(&value))
        .unwrap_or_default();
    if let Some(pragma) = joined(headers, "pragma") {
        if pragma.to_ascii_lowercase().contains("no-cache") {
            cc.no_cache = true;
        }
    }
    cc
}

pub fn cache_key(method: &Method, url: &Url, headers: &HeaderMap) -> String {
    let mut key = format!("{} {}", method, url);
    for name in KEY_HEADERS {
        if let Some(value) = joined(headers, name) {
            key.push('\n');
            key.push_str(name);
            key.push_str(": ");
            key.push_str(&value);
        }
    }
    key
}

/// All values of a header joined with ", ", if present and valid UTF-8.
pub fn joined(headers: &HeaderMap, name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for name in headers.keys() {
        if let Some(value) = joined(headers, name.as_str()) {
            map.insert(name.as_str().to_string(), value);
        }
    }
    map
}

pub fn map_to_headers(map: &BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(map.len());
    for (name, value) in map {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

/// Parses an HTTP date: IMF-fixdate (or any RFC 2822 form), plus the obsolete
/// RFC 850 and asctime forms recipients still have to accept.
pub fn http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    OBSOLETE_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Seconds the response stays fresh after it was generated.
pub fn freshness_lifetime(headers: &BTreeMap<String, String>, stored_at: DateTime<Utc>) -> i64 {
    let cc = CacheControl::of_entry(headers);
    if let Some(seconds) = cc.s_maxage.or(cc.max_age) {
        return i64::try_from(seconds).unwrap_or(i64::MAX);
    }

    if let Some(expires) = headers.get("expires") {
        // An unparseable Expires means "already expired"
        let Some(expires) = http_date(expires) else {
            return 0;
        };
        let date = headers
            .get("date")
            .and_then(|date| http_date(date))
            .unwrap_or(stored_at);
        return (expires - date).num_seconds().max(0);
    }

    0
}

/// Seconds elapsed since the origin generated the response.
pub fn current_age(
    headers: &BTreeMap<String, String>,
    stored_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> i64 {
    let age_value = headers.get("age").map_or(0, |age| delta_seconds(age));
    let apparent_age = headers
        .get("date")
        .and_then(|date| http_date(date))
        .map(|date| (stored_at - date).num_seconds().max(0))
        .unwrap_or(0);
    let resident = (now - stored_at).num_seconds().max(0);

    apparent_age.max(age_value).saturating_add(resident)
}

// Non-negative integer seconds; overlong values clamp instead of failing
fn delta_seconds(value: &str) -> i64 {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    value
        .parse::<i64>()
        .map_or(MAX_DELTA_SECONDS, |seconds| seconds.min(MAX_DELTA_SECONDS))
}

pub fn freshness(entry: &CacheEntry, request: &CacheControl, now: DateTime<Utc>) -> Freshness {
    let response = CacheControl::of_entry(&entry.headers);
    if request.no_cache || response.no_cache {
        return Freshness::Stale;
    }

    let lifetime = freshness_lifetime(&entry.headers, entry.stored_at);
    let age = current_age(&entry.headers, entry.stored_at, now);

    if let Some(max_age) = request.max_age {
        if age > i64::try_from(max_age).unwrap_or(i64::MAX) {
            return Freshness::Stale;
        }
    }

    let min_fresh = request
        .min_fresh
        .map(|s| i64::try_from(s).unwrap_or(i64::MAX))
        .unwrap_or(0);
    if age.saturating_add(min_fresh) < lifetime {
        return Freshness::Fresh;
    }

    if let Some(max_stale) = request.max_stale {
        let staleness = u64::try_from(age.saturating_sub(lifetime)).unwrap_or(0);
        if !response.revalidation_required() && staleness <= max_stale {
            return Freshness::Fresh;
        }
    }

    Freshness::Stale
}

/// Whether a response may be written to a shared cache.
pub fn is_storable(status: u16, headers: &BTreeMap<String, String>, request: &CacheControl) -> bool {
    if !STORABLE_STATUSES.contains(&status) {
        return false;
    }

    let response = CacheControl::of_entry(headers);
    if response.no_store || response.private || request.no_store {
        return false;
    }

    if vary_names(headers).iter().any(|name| name == "*") {
        return false;
    }

    // Entries that could neither be served nor revalidated are useless
    freshness_lifetime(headers, Utc::now()) > 0 || has_validator(headers)
}

pub fn has_validator(headers: &BTreeMap<String, String>) -> bool {
    headers.contains_key("etag") || headers.contains_key("last-modified")
}

/// Conditional request headers built from the entry's validators.
pub fn conditional_headers(entry: &CacheEntry) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(etag) = entry.header("etag").and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(IF_NONE_MATCH, etag);
    }
    if let Some(modified) = entry
        .header("last-modified")
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(IF_MODIFIED_SINCE, modified);
    }
    headers
}

/// Applies the headers of a `304 Not Modified` to a stored entry.
pub fn merge_not_modified(stored: &mut BTreeMap<String, String>, fresh: &BTreeMap<String, String>) {
    for (name, value) in fresh {
        if !NOT_MODIFIED_SKIP.contains(&name.as_str()) {
            stored.insert(name.clone(), value.clone());
        }
    }
}

pub fn vary_names(headers: &BTreeMap<String, String>) -> Vec<String> {
    headers
        .get("vary")
        .map(|vary| {
            vary.split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Request header values named by the response's `Vary` header.
pub fn vary_values(
    response: &BTreeMap<String, String>,
    request: &HeaderMap,
) -> BTreeMap<String, String> {
    vary_names(response)
        .into_iter()
        .map(|name| {
            let value = joined(request, &name).unwrap_or_default();
            (name, value)
        })
        .collect()
}

pub fn vary_matches(entry: &CacheEntry, request: &HeaderMap) -> bool {
    vary_names(&entry.headers).iter().all(|name| {
        let wanted = joined(request, name).unwrap_or_default();
        entry.varied.get(name).map(String::as_str).unwrap_or("") == wanted
    })
}

/// True if `stale-if-error` still covers serving this stale entry.
pub fn stale_if_error(entry: &CacheEntry, now: DateTime<Utc>) -> bool {
    let response = CacheControl::of_entry(&entry.headers);
    if response.revalidation_required() || response.no_cache {
        return false;
    }
    let Some(window) = response.stale_if_error else {
        return false;
    };
    let lifetime = freshness_lifetime(&entry.headers, entry.stored_at);
    let age = current_age(&entry.headers, entry.stored_at, now);
    age.saturating_sub(lifetime) <= i64::try_from(window).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Duration;

    fn entry(headers: &[(&str, &str)], stored_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            key: "k".to_string(),
            status: 200,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            varied: BTreeMap::new(),
            body: Bytes::new(),
            stored_at,
        }
    }

    fn map(headers: &[(&str, &str)]) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_directives() {
        let cc = CacheControl::parse("public, Max-Age=60, s-maxage=\"30\", no-cache, stale-if-error=5, max-stale");
        assert_eq!(cc.max_age, Some(60));
        assert_eq!(cc.s_maxage, Some(30));
        assert_eq!(cc.stale_if_error, Some(5));
        assert_eq!(cc.max_stale, Some(u64::MAX));
        assert!(cc.no_cache);
        assert!(!cc.no_store);
    }

    #[test]
    fn max_age_entry_is_fresh_then_stale() {
        let now = Utc::now();
        let cached = entry(&[("cache-control", "max-age=60")], now - Duration::seconds(30));
        assert_eq!(freshness(&cached, &CacheControl::default(), now), Freshness::Fresh);

        let old = entry(&[("cache-control", "max-age=60")], now - Duration::seconds(61));
        assert_eq!(freshness(&old, &CacheControl::default(), now), Freshness::Stale);
    }

    #[test]
    fn expires_relative_to_date() {
        let now = Utc::now();
        let date = now.to_rfc2822();
        let expires = (now + Duration::seconds(120)).to_rfc2822();
        let cached = entry(&[("date", &date), ("expires", &expires)], now);
        assert_eq!(freshness_lifetime(&cached.headers, now), 120);
        assert_eq!(freshness(&cached, &CacheControl::default(), now), Freshness::Fresh);

        let invalid = map(&[("expires", "0")]);
        assert_eq!(freshness_lifetime(&invalid, now), 0);
    }

    #[test]
    fn parses_gmt_dates() {
        let stored = DateTime::parse_from_rfc3339("1994-11-15T08:12:31Z")
            .unwrap()
            .with_timezone(&Utc);
        let headers = map(&[
            ("date", "Tue, 15 Nov 1994 08:12:31 GMT"),
            ("expires", "Tue, 15 Nov 1994 09:12:31 GMT"),
        ]);
        assert_eq!(freshness_lifetime(&headers, stored), 3600);
    }

    #[test]
    fn age_header_counts_toward_age() {
        let now = Utc::now();
        let cached = entry(&[("cache-control", "max-age=60"), ("age", "50")], now - Duration::seconds(15));
        assert_eq!(current_age(&cached.headers, cached.stored_at, now), 65);
        assert_eq!(freshness(&cached, &CacheControl::default(), now), Freshness::Stale);
    }

    #[test]
    fn parses_obsolete_date_forms() {
        let expected = DateTime::parse_from_rfc3339("1994-11-06T08:49:37Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(expected));
        assert_eq!(http_date("Sunday, 06-Nov-94 08:49:37 GMT"), Some(expected));
        assert_eq!(http_date("Sun Nov  6 08:49:37 1994"), Some(expected));
        assert_eq!(http_date("yesterday"), None);

        let headers = map(&[
            ("date", "Sunday, 06-Nov-94 08:49:37 GMT"),
            ("expires", "Sun Nov  6 09:49:37 1994"),
        ]);
        assert_eq!(freshness_lifetime(&headers, expected), 3600);
    }

    #[test]
    fn huge_age_header_is_clamped() {
        let now = Utc::now();
        let stored_at = now - Duration::seconds(5);
        for age in [i64::MAX.to_string(), "99999999999999999999999".to_string()] {
            let cached = entry(
                &[("cache-control", "max-age=60, stale-if-error=60"), ("age", age.as_str())],
                stored_at,
            );
            assert_eq!(
                current_age(&cached.headers, cached.stored_at, now),
                MAX_DELTA_SECONDS + 5
            );
            assert_eq!(freshness(&cached, &CacheControl::default(), now), Freshness::Stale);
            assert!(!stale_if_error(&cached, now));

            let lenient = CacheControl::parse("max-stale=60");
            assert_eq!(freshness(&cached, &lenient, now), Freshness::Stale);
        }
    }

    #[test]
    fn malformed_age_is_ignored() {
        let now = Utc::now();
        let cached = entry(&[("cache-control", "max-age=60"), ("age", "-30")], now);
        assert_eq!(current_age(&cached.headers, cached.stored_at, now), 0);
    }

    #[test]
    fn no_cache_forces_revalidation() {
        let now = Utc::now();
        let cached = entry(&[("cache-control", "max-age=600, no-cache")], now);
        assert_eq!(freshness(&cached, &CacheControl::default(), now), Freshness::Stale);

        let plain = entry(&[("cache-control", "max-age=600")], now);
        let request = CacheControl::parse("no-cache");
        assert_eq!(freshness(&plain, &request, now), Freshness::Stale);
    }

    #[test]
    fn request_directives_limit_freshness() {
        let now = Utc::now();
        let cached = entry(&[("cache-control", "max-age=600")], now - Duration::seconds(100));
        assert_eq!(freshness(&cached, &CacheControl::parse("max-age=50"), now), Freshness::Stale);
        assert_eq!(freshness(&cached, &CacheControl::parse("min-fresh=550"), now), Freshness::Stale);

        let stale = entry(&[("cache-control", "max-age=10")], now - Duration::seconds(20));
        assert_eq!(freshness(&stale, &CacheControl::parse("max-stale=30"), now), Freshness::Fresh);

        let strict = entry(&[("cache-control", "max-age=10, must-revalidate")], now - Duration::seconds(20));
        assert_eq!(freshness(&strict, &CacheControl::parse("max-stale"), now), Freshness::Stale);
    }

    #[test]
    fn pragma_no_cache_is_honoured() {
        let mut headers = HeaderMap::new();
        headers.insert("pragma", HeaderValue::from_static("no-cache"));
        assert!(request_directives(&headers).no_cache);
    }

    #[test]
    fn storability_rules() {
        let request = CacheControl::default();
        assert!(is_storable(200, &map(&[("cache-control", "max-age=60")]), &request));
        assert!(is_storable(200, &map(&[("etag", "\"v1\"")]), &request));
        assert!(!is_storable(200, &map(&[]), &request));
        assert!(!is_storable(200, &map(&[("cache-control", "no-store, max-age=60")]), &request));
        assert!(!is_storable(200, &map(&[("cache-control", "private, max-age=60")]), &request));
        assert!(!is_storable(206, &map(&[("cache-control", "max-age=60")]), &request));
        assert!(!is_storable(500, &map(&[("cache-control", "max-age=60")]), &request));
        assert!(!is_storable(200, &map(&[("cache-control", "max-age=60"), ("vary", "*")]), &request));
        assert!(!is_storable(
            200,
            &map(&[("cache-control", "max-age=60")]),
            &CacheControl::parse("no-store")
        ));
    }

    #[test]
    fn cache_key_includes_representation_headers() {
        let url = Url::parse("http://images.example.com/a.png").unwrap();
        let mut headers = HeaderMap::new();
        let plain = cache_key(&Method::GET, &url, &headers);
        headers.insert("accept", HeaderValue::from_static("image/webp"));
        headers.insert("user-agent", HeaderValue::from_static("test"));
        let webp = cache_key(&Method::GET, &url, &headers);

        assert_eq!(plain, "GET http://images.example.com/a.png");
        assert_ne!(plain, webp);
        assert!(!webp.contains("user-agent"));
    }

    #[test]
    fn conditional_headers_from_validators() {
        let cached = entry(
            &[("etag", "\"abc\""), ("last-modified", "Tue, 15 Nov 1994 08:12:31 GMT")],
            Utc::now(),
        );
        let headers = conditional_headers(&cached);
        assert_eq!(headers.get(IF_NONE_MATCH).unwrap(), "\"abc\"");
        assert_eq!(headers.get(IF_MODIFIED_SINCE).unwrap(), "Tue, 15 Nov 1994 08:12:31 GMT");
    }

    #[test]
    fn merge_keeps_body_length() {
        let mut stored = map(&[("content-length", "10"), ("etag", "\"a\""), ("cache-control", "max-age=1")]);
        merge_not_modified(
            &mut stored,
            &map(&[("content-length", "0"), ("cache-control", "max-age=60")]),
        );
        assert_eq!(stored["content-length"], "10");
        assert_eq!(stored["cache-control"], "max-age=60");
        assert_eq!(stored["etag"], "\"a\"");
    }

    #[test]
    fn vary_selects_matching_requests() {
        let mut cached = entry(&[("vary", "User-Agent")], Utc::now());
        let mut request = HeaderMap::new();
        request.insert("user-agent", HeaderValue::from_static("a"));
        cached.varied = vary_values(&cached.headers, &request);

        assert!(vary_matches(&cached, &request));
        request.insert("user-agent", HeaderValue::from_static("b"));
        assert!(!vary_matches(&cached, &request));
    }

    #[test]
    fn stale_if_error_window() {
        let now = Utc::now();
        let within = entry(&[("cache-control", "max-age=10, stale-if-error=60")], now - Duration::seconds(30));
        assert!(stale_if_error(&within, now));

        let beyond = entry(&[("cache-control", "max-age=10, stale-if-error=5")], now - Duration::seconds(30));
        assert!(!stale_if_error(&beyond, now));

        let strict = entry(
            &[("cache-control", "max-age=10, stale-if-error=60, must-revalidate")],
            now - Duration::seconds(30),
        );
        assert!(!stale_if_error(&strict, now));
    }
}
