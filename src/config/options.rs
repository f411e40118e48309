//! Per-instance and per-call proxy options.
//!
//! Instance defaults and call-site overrides share one type. Every field is
//! optional so that merging is a per-field "call site wins" `or`, after which
//! [`ProxyOptions::resolve`] normalizes destinations and applies defaults once,
//! at the dispatch boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::config::schema::TlsConfig;
use crate::error::ProxyError;

/// Default cap on redirects followed by the redirect-following transport.
pub const DEFAULT_MAX_REDIRECTS: usize = 21;

/// Which destination an outgoing request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Primary destination whose response is relayed to the client.
    Target,
    /// Mirror destination whose response is discarded.
    Forward,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Target => "target",
            Role::Forward => "forward",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A destination as supplied by the caller: raw text or an already parsed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Raw(String),
    Parsed(Url),
}

impl Destination {
    /// Parse (if needed) and check the scheme.
    pub fn resolve(&self, role: Role) -> Result<Url, ProxyError> {
        let url = match self {
            Destination::Parsed(url) => url.clone(),
            Destination::Raw(raw) => Url::parse(raw).map_err(|source| ProxyError::InvalidDestination {
                role,
                url: raw.clone(),
                source,
            })?,
        };
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(url),
            other => Err(ProxyError::UnsupportedScheme {
                role,
                scheme: other.to_string(),
            }),
        }
    }
}

impl From<&str> for Destination {
    fn from(raw: &str) -> Self {
        Destination::Raw(raw.to_string())
    }
}

impl From<String> for Destination {
    fn from(raw: String) -> Self {
        Destination::Raw(raw)
    }
}

impl From<Url> for Destination {
    fn from(url: Url) -> Self {
        Destination::Parsed(url)
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Destination::Raw)
    }
}

/// Cookie attribute rewriting: one replacement for everything, or a map
/// from old value to new value where `*` matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CookieRewrite {
    All(String),
    Map(BTreeMap<String, String>),
}

impl CookieRewrite {
    /// Replacement for `current`, if any. An empty replacement removes the attribute.
    pub fn lookup(&self, current: &str) -> Option<&str> {
        match self {
            CookieRewrite::All(value) => Some(value),
            CookieRewrite::Map(map) => map
                .get(current)
                .or_else(|| map.get("*"))
                .map(String::as_str),
        }
    }
}

/// Proxy options. Used both as instance defaults and as per-call overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyOptions {
    /// Primary destination.
    pub target: Option<Destination>,
    /// Mirror destination.
    pub forward: Option<Destination>,
    /// TLS material for an owned listener.
    pub ssl: Option<TlsConfig>,
    /// Route upgrade requests through the ws pipeline.
    pub ws: Option<bool>,
    /// Append `x-forwarded-*` headers.
    pub xfwd: Option<bool>,
    /// Prefix the destination path onto the request path (default true).
    pub prepend_path: Option<bool>,
    /// Drop the inbound request path entirely.
    pub ignore_path: Option<bool>,
    /// Rewrite `Host` to the destination authority.
    pub change_origin: Option<bool>,
    /// Pre-read request body used instead of the inbound body.
    #[serde(skip)]
    pub buffer: Option<Bytes>,
    /// Leave response construction to a `proxy_res` hook.
    pub self_handle_response: Option<bool>,
    /// Use the redirect-following transport.
    pub follow_redirects: Option<bool>,
    /// Redirect cap for `follow_redirects`.
    pub max_redirects: Option<usize>,
    /// Inbound body idle timeout in milliseconds.
    pub timeout: Option<u64>,
    /// Upstream response timeout in milliseconds.
    pub proxy_timeout: Option<u64>,
    /// Extra headers set on the outgoing request.
    pub headers: Option<BTreeMap<String, String>>,
    /// `user:password` for HTTP Basic authentication upstream.
    pub auth: Option<String>,
    /// Outgoing method override.
    pub method: Option<String>,
    /// Host used when rewriting redirect `Location` headers.
    pub host_rewrite: Option<String>,
    /// Rewrite redirect `Location` host to the inbound `Host`.
    pub auto_rewrite: Option<bool>,
    /// Scheme used when rewriting redirect `Location` headers.
    pub protocol_rewrite: Option<String>,
    /// `Domain` attribute rewriting for `Set-Cookie`.
    pub cookie_domain_rewrite: Option<CookieRewrite>,
    /// `Path` attribute rewriting for `Set-Cookie`.
    pub cookie_path_rewrite: Option<CookieRewrite>,
}

macro_rules! merge_fields {
    ($base:expr, $over:expr, $($field:ident),+ $(,)?) => {
        ProxyOptions {
            $($field: $over.$field.clone().or_else(|| $base.$field.clone()),)+
        }
    };
}

impl ProxyOptions {
    /// Options with only a target set.
    pub fn with_target(target: impl Into<Destination>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }

    /// Options with only a forward set.
    pub fn with_forward(forward: impl Into<Destination>) -> Self {
        Self {
            forward: Some(forward.into()),
            ..Self::default()
        }
    }

    /// Shallow merge: every field present in `overrides` wins.
    pub fn merged(&self, overrides: &ProxyOptions) -> ProxyOptions {
        merge_fields!(
            self,
            overrides,
            target,
            forward,
            ssl,
            ws,
            xfwd,
            prepend_path,
            ignore_path,
            change_origin,
            buffer,
            self_handle_response,
            follow_redirects,
            max_redirects,
            timeout,
            proxy_timeout,
            headers,
            auth,
            method,
            host_rewrite,
            auto_rewrite,
            protocol_rewrite,
            cookie_domain_rewrite,
            cookie_path_rewrite,
        )
    }

    /// Normalize destinations and apply defaults.
    pub fn resolve(&self) -> Result<ResolvedOptions, ProxyError> {
        let target = self
            .target
            .as_ref()
            .map(|d| d.resolve(Role::Target))
            .transpose()?;
        let forward = self
            .forward
            .as_ref()
            .map(|d| d.resolve(Role::Forward))
            .transpose()?;
        if target.is_none() && forward.is_none() {
            return Err(ProxyError::MissingDestination);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in self.headers.iter().flatten() {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(axum::http::Error::from)?;
            let value = HeaderValue::from_str(value).map_err(axum::http::Error::from)?;
            headers.insert(name, value);
        }

        let method = self
            .method
            .as_deref()
            .map(|m| Method::from_bytes(m.as_bytes()))
            .transpose()
            .map_err(axum::http::Error::from)?;

        Ok(ResolvedOptions {
            target,
            forward,
            ws: self.ws.unwrap_or(false),
            xfwd: self.xfwd.unwrap_or(false),
            prepend_path: self.prepend_path.unwrap_or(true),
            ignore_path: self.ignore_path.unwrap_or(false),
            change_origin: self.change_origin.unwrap_or(false),
            buffer: self.buffer.clone(),
            self_handle_response: self.self_handle_response.unwrap_or(false),
            follow_redirects: self.follow_redirects.unwrap_or(false),
            max_redirects: self.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS),
            timeout: self.timeout.filter(|ms| *ms > 0).map(Duration::from_millis),
            proxy_timeout: self.proxy_timeout.filter(|ms| *ms > 0).map(Duration::from_millis),
            headers,
            auth: self.auth.clone(),
            method,
            host_rewrite: self.host_rewrite.clone(),
            auto_rewrite: self.auto_rewrite.unwrap_or(false),
            protocol_rewrite: self.protocol_rewrite.clone(),
            cookie_domain_rewrite: self.cookie_domain_rewrite.clone(),
            cookie_path_rewrite: self.cookie_path_rewrite.clone(),
        })
    }
}

/// Options after merging and normalization, consumed by the passes.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub target: Option<Url>,
    pub forward: Option<Url>,
    pub ws: bool,
    pub xfwd: bool,
    pub prepend_path: bool,
    pub ignore_path: bool,
    pub change_origin: bool,
    pub buffer: Option<Bytes>,
    pub self_handle_response: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub timeout: Option<Duration>,
    pub proxy_timeout: Option<Duration>,
    pub headers: HeaderMap,
    pub auth: Option<String>,
    pub method: Option<Method>,
    pub host_rewrite: Option<String>,
    pub auto_rewrite: bool,
    pub protocol_rewrite: Option<String>,
    pub cookie_domain_rewrite: Option<CookieRewrite>,
    pub cookie_path_rewrite: Option<CookieRewrite>,
}

impl ResolvedOptions {
    /// The destination for `role`, if configured.
    pub fn destination(&self, role: Role) -> Option<&Url> {
        match role {
            Role::Target => self.target.as_ref(),
            Role::Forward => self.forward.as_ref(),
        }
    }

    /// The destination announced in `start`: target, else forward.
    pub fn primary(&self) -> Option<&Url> {
        self.target.as_ref().or(self.forward.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_site_wins_per_key() {
        let defaults = ProxyOptions {
            target: Some("http://a.example".into()),
            xfwd: Some(true),
            timeout: Some(100),
            ..Default::default()
        };
        let overrides = ProxyOptions {
            target: Some("http://b.example".into()),
            timeout: Some(5),
            ..Default::default()
        };

        let merged = defaults.merged(&overrides);
        assert_eq!(merged.target, Some(Destination::from("http://b.example")));
        assert_eq!(merged.xfwd, Some(true));
        assert_eq!(merged.timeout, Some(5));
    }

    #[test]
    fn resolve_requires_a_destination() {
        let err = ProxyOptions::default().resolve().unwrap_err();
        assert!(matches!(err, ProxyError::MissingDestination));
    }

    #[test]
    fn resolve_applies_defaults() {
        let resolved = ProxyOptions::with_target("http://localhost:9000").resolve().unwrap();
        assert!(resolved.prepend_path);
        assert!(!resolved.xfwd);
        assert_eq!(resolved.max_redirects, DEFAULT_MAX_REDIRECTS);
        assert_eq!(resolved.target.unwrap().port(), Some(9000));
        assert!(resolved.forward.is_none());
    }

    #[test]
    fn resolve_rejects_bad_destinations() {
        let err = ProxyOptions::with_target("not a url").resolve().unwrap_err();
        assert!(matches!(err, ProxyError::InvalidDestination { role: Role::Target, .. }));

        let err = ProxyOptions::with_forward("ftp://files.example").resolve().unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedScheme { role: Role::Forward, .. }));
    }

    #[test]
    fn parsed_destinations_pass_through() {
        let url = Url::parse("https://upstream.example/base").unwrap();
        let resolved = ProxyOptions::with_target(url.clone()).resolve().unwrap();
        assert_eq!(resolved.target, Some(url));
    }

    #[test]
    fn cookie_rewrite_lookup() {
        let all = CookieRewrite::All("proxy.example".into());
        assert_eq!(all.lookup("upstream.example"), Some("proxy.example"));

        let mut map = BTreeMap::new();
        map.insert("old.example".to_string(), "new.example".to_string());
        let map = CookieRewrite::Map(map);
        assert_eq!(map.lookup("old.example"), Some("new.example"));
        assert_eq!(map.lookup("other.example"), None);
    }

    #[test]
    fn deserializes_from_toml() {
        let options: ProxyOptions = toml::from_str(
            r#"
            target = "http://127.0.0.1:3000"
            xfwd = true
            proxy_timeout = 2500
            cookie_domain_rewrite = { "*" = "" }
            "#,
        )
        .unwrap();
        assert_eq!(options.target, Some(Destination::from("http://127.0.0.1:3000")));
        assert_eq!(options.proxy_timeout, Some(2500));
        assert!(matches!(options.cookie_domain_rewrite, Some(CookieRewrite::Map(_))));
    }
}
