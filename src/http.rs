//! HTTP transport wiring: client construction, the session cookie jar, and
//! the response snapshot bound to flows.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::errors::{Error, Result};
use crate::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_USER_AGENT};

/// Transport configuration for one session.
///
/// Plain options struct in the spirit of a client `Config`: every field has a
/// default, and a pre-built `reqwest::Client` can be injected to take over
/// the transport entirely.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Upstream proxy URL (http, https or socks5) relayed all traffic.
    pub proxy: Option<String>,
    /// Verify TLS certificates. Turning this off is common when the traffic
    /// is relayed through an intercepting proxy.
    pub verify: bool,
    pub user_agent: Option<String>,
    /// Override the connect timeout (defaults to 5s).
    pub connect_timeout: Option<Duration>,
    /// Override the request timeout (defaults to 60s).
    pub timeout: Option<Duration>,
    /// Use this client instead of building one. The caller then owns
    /// redirect and cookie middleware behaviour.
    pub http_client: Option<reqwest::Client>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            verify: true,
            user_agent: None,
            connect_timeout: None,
            timeout: None,
            http_client: None,
        }
    }
}

pub(crate) fn build_client(
    cfg: &TransportConfig,
    jar: Arc<CookieJar>,
) -> Result<reqwest::Client> {
    if let Some(client) = &cfg.http_client {
        return Ok(client.clone());
    }
    let mut builder = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
        .timeout(cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
        .user_agent(
            cfg.user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        )
        .cookie_provider(jar);
    if !cfg.verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = &cfg.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|err| Error::config(format!("invalid proxy url: {err}")))?;
        builder = builder.proxy(proxy);
    }
    Ok(builder.build()?)
}

/// One stored cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    /// Set without a `Domain` attribute: sent to the exact host only, never
    /// to sibling subdomains.
    #[serde(default)]
    pub host_only: bool,
}

/// Session cookie jar keyed by (domain, path, name).
///
/// Implements [`reqwest::cookie::CookieStore`] so `Set-Cookie` headers merge
/// into the jar on every response, including redirect intermediates, while
/// the contents stay iterable for persistence. `Max-Age<=0` removes the
/// cookie; `Expires` is not evaluated.
#[derive(Debug, Default)]
pub struct CookieJar {
    entries: Mutex<BTreeMap<(String, String, String), CookieRecord>>,
}

impl CookieJar {
    pub fn insert(&self, record: CookieRecord) {
        let key = (
            record.domain.clone(),
            record.path.clone(),
            record.name.clone(),
        );
        self.entries
            .lock()
            .expect("cookie jar lock poisoned")
            .insert(key, record);
    }

    fn remove(&self, domain: &str, path: &str, name: &str) {
        self.entries
            .lock()
            .expect("cookie jar lock poisoned")
            .remove(&(domain.to_string(), path.to_string(), name.to_string()));
    }

    /// All records in (domain, path, name) order.
    pub fn records(&self) -> Vec<CookieRecord> {
        self.entries
            .lock()
            .expect("cookie jar lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Replaces the jar contents, used when reloading a persisted session.
    pub fn replace(&self, records: Vec<CookieRecord>) {
        let mut entries = self.entries.lock().expect("cookie jar lock poisoned");
        entries.clear();
        for record in records {
            let key = (
                record.domain.clone(),
                record.path.clone(),
                record.name.clone(),
            );
            entries.insert(key, record);
        }
    }

    /// Last stored value for a cookie name, regardless of domain.
    pub fn value(&self, name: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("cookie jar lock poisoned")
            .values()
            .filter(|record| record.name == name)
            .last()
            .map(|record| record.value.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cookie jar lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cookies applicable to the target URL as (name, value) pairs.
    pub(crate) fn matching(&self, url: &Url) -> Vec<(String, String)> {
        let host = url.host_str().unwrap_or_default();
        let https = url.scheme() == "https";
        let path = url.path();
        self.entries
            .lock()
            .expect("cookie jar lock poisoned")
            .values()
            .filter(|record| {
                if record.host_only {
                    host == record.domain
                } else {
                    domain_matches(host, &record.domain)
                }
            })
            .filter(|record| path.starts_with(record.path.as_str()) || record.path == "/")
            .filter(|record| https || !record.secure)
            .map(|record| (record.name.clone(), record.value.clone()))
            .collect()
    }

    /// Merges one raw `Set-Cookie` header received for `url`.
    pub(crate) fn merge_set_cookie(&self, raw: &str, url: &Url) {
        match parse_set_cookie(raw, url) {
            Some(ParsedCookie::Store(record)) => {
                debug!(cookie = %record.name, domain = %record.domain, "storing cookie");
                self.insert(record);
            }
            Some(ParsedCookie::Clear { domain, path, name }) => {
                debug!(cookie = %name, "clearing cookie");
                self.remove(&domain, &path, &name);
            }
            None => warn!(header = raw, "unparseable set-cookie header"),
        }
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

enum ParsedCookie {
    Store(CookieRecord),
    Clear {
        domain: String,
        path: String,
        name: String,
    },
}

fn parse_set_cookie(raw: &str, url: &Url) -> Option<ParsedCookie> {
    let mut segments = raw.split(';');
    let pair = segments.next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut domain = url.host_str().unwrap_or_default().to_string();
    let mut host_only = true;
    let mut path = "/".to_string();
    let mut secure = false;
    let mut cleared = false;
    for segment in segments {
        let segment = segment.trim();
        let (attr, attr_value) = match segment.split_once('=') {
            Some((a, v)) => (a.trim(), v.trim()),
            None => (segment, ""),
        };
        if attr.eq_ignore_ascii_case("domain") && !attr_value.is_empty() {
            domain = attr_value.trim_start_matches('.').to_string();
            host_only = false;
        } else if attr.eq_ignore_ascii_case("path") && !attr_value.is_empty() {
            path = attr_value.to_string();
        } else if attr.eq_ignore_ascii_case("secure") {
            secure = true;
        } else if attr.eq_ignore_ascii_case("max-age") {
            cleared = attr_value.parse::<i64>().map(|age| age <= 0).unwrap_or(false);
        }
    }

    if cleared {
        return Some(ParsedCookie::Clear {
            domain,
            path,
            name: name.to_string(),
        });
    }
    Some(ParsedCookie::Store(CookieRecord {
        name: name.to_string(),
        value: value.trim().to_string(),
        domain,
        path,
        secure,
        host_only,
    }))
}

impl reqwest::cookie::CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        for header in cookie_headers {
            if let Ok(raw) = header.to_str() {
                self.merge_set_cookie(raw, url);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let pairs = self.matching(url);
        if pairs.is_empty() {
            return None;
        }
        let joined = pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }
}

/// The response a flow binds against: status, headers, and the body decoded
/// as text, captured once after the HTTP round-trip.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl ResponseSnapshot {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: String) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub(crate) async fn read(response: reqwest::Response) -> Result<Self> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.text().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Header value by name; name matching is case-insensitive because the
    /// client normalises names to lowercase. When repeated, the last wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .filter(|(header, _)| header.eq_ignore_ascii_case(name))
            .last()
            .map(|(_, value)| value.as_str())
    }

    /// All `Set-Cookie` pairs of this response as (name, value), in order.
    pub fn set_cookie_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(header, _)| header.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, value)| {
                let pair = value.split(';').next()?;
                let (name, value) = pair.split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }

    /// Cookie value by case-sensitive name from this response's `Set-Cookie`
    /// list. When repeated, the last wins.
    pub fn set_cookie(&self, name: &str) -> Option<String> {
        self.set_cookie_pairs()
            .into_iter()
            .filter(|(cookie, _)| cookie == name)
            .last()
            .map(|(_, value)| value)
    }

    pub(crate) fn raw_set_cookies(&self) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(header, _)| header.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, value)| value.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn set_cookie_defaults_to_request_host() {
        let jar = CookieJar::default();
        jar.merge_set_cookie("sid=abc; Path=/", &url("https://example.com/login"));
        let records = jar.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].domain, "example.com");
        assert_eq!(records[0].value, "abc");
        assert!(records[0].host_only);
    }

    #[test]
    fn host_only_cookies_stay_on_their_host() {
        let jar = CookieJar::default();
        jar.merge_set_cookie("sid=abc; Path=/", &url("https://auth.example.com/"));
        assert_eq!(
            jar.matching(&url("https://auth.example.com/session")),
            vec![("sid".to_string(), "abc".to_string())]
        );
        assert!(jar.matching(&url("https://app.example.com/")).is_empty());
        assert!(jar.matching(&url("https://example.com/")).is_empty());
    }

    #[test]
    fn domain_attribute_widens_to_subdomains() {
        let jar = CookieJar::default();
        jar.merge_set_cookie(
            "sid=abc; Domain=.example.com; Path=/",
            &url("https://auth.example.com/"),
        );
        assert_eq!(
            jar.matching(&url("https://app.example.com/dashboard")),
            vec![("sid".to_string(), "abc".to_string())]
        );
        assert!(jar.matching(&url("https://example.org/")).is_empty());
    }

    #[test]
    fn secure_cookies_skip_plain_http() {
        let jar = CookieJar::default();
        jar.merge_set_cookie("sid=abc; Secure", &url("https://example.com/"));
        assert!(jar.matching(&url("http://example.com/")).is_empty());
        assert_eq!(jar.matching(&url("https://example.com/")).len(), 1);
    }

    #[test]
    fn max_age_zero_clears_the_cookie() {
        let jar = CookieJar::default();
        let target = url("https://example.com/");
        jar.merge_set_cookie("sid=abc", &target);
        assert_eq!(jar.len(), 1);
        jar.merge_set_cookie("sid=gone; Max-Age=0", &target);
        assert!(jar.is_empty());
    }

    #[test]
    fn jar_records_are_sorted_and_replaceable() {
        let jar = CookieJar::default();
        let target = url("https://example.com/");
        jar.merge_set_cookie("zeta=1", &target);
        jar.merge_set_cookie("alpha=2", &target);
        let records = jar.records();
        assert_eq!(records[0].name, "alpha");
        assert_eq!(records[1].name, "zeta");

        let other = CookieJar::default();
        other.replace(records.clone());
        assert_eq!(other.records(), records);
    }

    #[test]
    fn snapshot_header_is_case_insensitive() {
        let snapshot = ResponseSnapshot::new(
            200,
            vec![("content-type".to_string(), "text/html".to_string())],
            String::new(),
        );
        assert_eq!(snapshot.header("Content-Type"), Some("text/html"));
        assert_eq!(snapshot.header("x-missing"), None);
    }
}
