//! The response rewrite chain, run when the upstream head arrives.
//!
//! ```text
//! remove_hop_headers → rewrite_location → write_headers → write_status_code
//! ```

use std::sync::Arc;

use axum::http::header::{self, HeaderValue};
use axum::http::StatusCode;
use url::{Position, Url};

use crate::config::{CookieRewrite, ResolvedOptions};
use crate::http::exchange::{OutboundResponse, RequestHead, UpstreamResponse};
use crate::http::outgoing::strip_hop_by_hop;
use crate::pipeline::{Named, ResponsePass, ResponsePassRef, Signal};

/// The response chain in its default order.
pub fn default_passes() -> Vec<ResponsePassRef> {
    vec![
        Arc::new(RemoveHopHeaders),
        Arc::new(RewriteLocation),
        Arc::new(WriteHeaders),
        Arc::new(WriteStatusCode),
    ]
}

/// Drops hop-by-hop headers; hyper frames the client response itself.
pub struct RemoveHopHeaders;

impl Named for RemoveHopHeaders {
    fn name(&self) -> &str {
        "remove_hop_headers"
    }
}

impl ResponsePass for RemoveHopHeaders {
    fn run(
        &self,
        _request: &RequestHead,
        _response: &mut OutboundResponse,
        upstream: &mut UpstreamResponse,
        _options: &ResolvedOptions,
    ) -> Signal {
        strip_hop_by_hop(upstream.headers_mut());
        Signal::Continue
    }
}

/// Rewrites redirect `Location` headers that point back at the target.
pub struct RewriteLocation;

impl Named for RewriteLocation {
    fn name(&self) -> &str {
        "rewrite_location"
    }
}

impl ResponsePass for RewriteLocation {
    fn run(
        &self,
        request: &RequestHead,
        _response: &mut OutboundResponse,
        upstream: &mut UpstreamResponse,
        options: &ResolvedOptions,
    ) -> Signal {
        if !(options.host_rewrite.is_some() || options.auto_rewrite || options.protocol_rewrite.is_some()) {
            return Signal::Continue;
        }
        if !is_rewritable_redirect(upstream.status()) {
            return Signal::Continue;
        }
        let Some(target) = &options.target else {
            return Signal::Continue;
        };
        let Some(location) = upstream
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Url::parse(v).ok())
        else {
            return Signal::Continue;
        };
        if host_and_port(target) != host_and_port(&location) {
            return Signal::Continue;
        }

        let host = match (&options.host_rewrite, options.auto_rewrite) {
            (Some(host), _) => host.clone(),
            (None, true) => request.host().map(str::to_string).unwrap_or_else(|| host_and_port(&location)),
            (None, false) => host_and_port(&location),
        };
        let scheme = options
            .protocol_rewrite
            .as_deref()
            .map(|p| p.trim_end_matches(':'))
            .unwrap_or(location.scheme());
        let rewritten = format!("{scheme}://{host}{}", &location[Position::BeforePath..]);

        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            upstream.headers_mut().insert(header::LOCATION, value);
        }
        Signal::Continue
    }
}

fn is_rewritable_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 201 | 301 | 302 | 307 | 308)
}

fn host_and_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Copies upstream headers onto the client response, rewriting cookies.
pub struct WriteHeaders;

impl Named for WriteHeaders {
    fn name(&self) -> &str {
        "write_headers"
    }
}

impl ResponsePass for WriteHeaders {
    fn run(
        &self,
        _request: &RequestHead,
        response: &mut OutboundResponse,
        upstream: &mut UpstreamResponse,
        options: &ResolvedOptions,
    ) -> Signal {
        let headers = response.headers_mut();
        for name in upstream.headers().keys() {
            headers.remove(name);
        }
        for (name, value) in upstream.headers() {
            if *name == header::SET_COOKIE {
                headers.append(name.clone(), rewrite_set_cookie(value, options));
            } else {
                headers.append(name.clone(), value.clone());
            }
        }
        Signal::Continue
    }
}

fn rewrite_set_cookie(value: &HeaderValue, options: &ResolvedOptions) -> HeaderValue {
    if options.cookie_domain_rewrite.is_none() && options.cookie_path_rewrite.is_none() {
        return value.clone();
    }
    let Ok(cookie) = value.to_str() else {
        return value.clone();
    };
    let mut cookie = cookie.to_string();
    if let Some(rewrite) = &options.cookie_domain_rewrite {
        cookie = rewrite_cookie_property(&cookie, rewrite, "domain");
    }
    if let Some(rewrite) = &options.cookie_path_rewrite {
        cookie = rewrite_cookie_property(&cookie, rewrite, "path");
    }
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| value.clone())
}

/// Rewrite the first `property=` attribute of a `Set-Cookie` value. An empty
/// replacement removes the attribute.
pub fn rewrite_cookie_property(cookie: &str, rewrite: &CookieRewrite, property: &str) -> String {
    let mut parts = cookie.split(';');
    let mut out = vec![parts.next().unwrap_or_default().to_string()];
    let mut done = false;
    for attribute in parts {
        let trimmed = attribute.trim();
        let matching = trimmed
            .split_once('=')
            .filter(|(key, _)| !done && key.trim().eq_ignore_ascii_case(property));
        match matching {
            Some((key, current)) => {
                done = true;
                match rewrite.lookup(current.trim()) {
                    Some("") => {}
                    Some(replacement) => out.push(format!(" {}={replacement}", key.trim())),
                    None => out.push(attribute.to_string()),
                }
            }
            None => out.push(attribute.to_string()),
        }
    }
    out.join(";")
}

/// Copies the upstream status.
pub struct WriteStatusCode;

impl Named for WriteStatusCode {
    fn name(&self) -> &str {
        "write_status_code"
    }
}

impl ResponsePass for WriteStatusCode {
    fn run(
        &self,
        _request: &RequestHead,
        response: &mut OutboundResponse,
        upstream: &mut UpstreamResponse,
        _options: &ResolvedOptions,
    ) -> Signal {
        response.set_status(upstream.status());
        Signal::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use axum::body::Body;
    use axum::http::{HeaderMap, Request, Version};
    use uuid::Uuid;

    use crate::config::ProxyOptions;
    use crate::http::exchange::ResponseHead;

    fn request(host: &str) -> RequestHead {
        let (parts, _) = Request::builder()
            .uri("/")
            .header(header::HOST, host)
            .body(())
            .unwrap()
            .into_parts();
        RequestHead::from_parts(Uuid::new_v4(), &parts)
    }

    fn upstream(status: StatusCode, headers: &[(&str, &str)]) -> UpstreamResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        UpstreamResponse::new(
            ResponseHead {
                status,
                version: Version::HTTP_11,
                headers: map,
            },
            Body::empty(),
        )
    }

    fn run_chain(request: &RequestHead, upstream: &mut UpstreamResponse, options: &ResolvedOptions) -> OutboundResponse {
        let mut response = OutboundResponse::new();
        for pass in default_passes() {
            if pass.run(request, &mut response, upstream, options).is_halt() {
                break;
            }
        }
        response
    }

    #[test]
    fn copies_status_and_headers_without_hop_headers() {
        let options = ProxyOptions::with_target("http://127.0.0.1:9000").resolve().unwrap();
        let mut up = upstream(
            StatusCode::CREATED,
            &[("content-type", "text/plain"), ("connection", "keep-alive"), ("x-a", "1"), ("x-a", "2")],
        );
        let response = run_chain(&request("proxy.local"), &mut up, &options);

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert!(response.headers().get("connection").is_none());
        assert_eq!(response.headers().get_all("x-a").iter().count(), 2);
    }

    #[test]
    fn auto_rewrite_uses_inbound_host() {
        let options = ProxyOptions {
            auto_rewrite: Some(true),
            ..ProxyOptions::with_target("http://backend.local:9000")
        }
        .resolve()
        .unwrap();
        let mut up = upstream(StatusCode::FOUND, &[("location", "http://backend.local:9000/login?next=/")]);
        let response = run_chain(&request("proxy.example:8080"), &mut up, &options);
        assert_eq!(response.headers()["location"], "http://proxy.example:8080/login?next=/");
    }

    #[test]
    fn host_and_protocol_rewrite() {
        let options = ProxyOptions {
            host_rewrite: Some("public.example".into()),
            protocol_rewrite: Some("https".into()),
            ..ProxyOptions::with_target("http://backend.local:9000")
        }
        .resolve()
        .unwrap();
        let mut up = upstream(StatusCode::MOVED_PERMANENTLY, &[("location", "http://backend.local:9000/a")]);
        let response = run_chain(&request("ignored"), &mut up, &options);
        assert_eq!(response.headers()["location"], "https://public.example/a");
    }

    #[test]
    fn foreign_or_non_redirect_locations_untouched() {
        let options = ProxyOptions {
            host_rewrite: Some("public.example".into()),
            ..ProxyOptions::with_target("http://backend.local:9000")
        }
        .resolve()
        .unwrap();
        let mut up = upstream(StatusCode::FOUND, &[("location", "http://elsewhere.example/a")]);
        let response = run_chain(&request("p"), &mut up, &options);
        assert_eq!(response.headers()["location"], "http://elsewhere.example/a");

        let mut up = upstream(StatusCode::OK, &[("location", "http://backend.local:9000/a")]);
        let response = run_chain(&request("p"), &mut up, &options);
        assert_eq!(response.headers()["location"], "http://backend.local:9000/a");
    }

    #[test]
    fn cookie_rewrites() {
        let mut domains = BTreeMap::new();
        domains.insert("backend.local".to_string(), "public.example".to_string());
        let domain = CookieRewrite::Map(domains);
        assert_eq!(
            rewrite_cookie_property("id=1; Domain=backend.local; Path=/", &domain, "domain"),
            "id=1; Domain=public.example; Path=/"
        );
        assert_eq!(
            rewrite_cookie_property("id=1; Domain=other.local", &domain, "domain"),
            "id=1; Domain=other.local"
        );

        let strip = CookieRewrite::All(String::new());
        assert_eq!(
            rewrite_cookie_property("id=1; Path=/api; HttpOnly", &strip, "path"),
            "id=1; HttpOnly"
        );
    }
}
