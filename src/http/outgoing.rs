//! Building the outgoing request for a destination.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Uri, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use url::Url;

use crate::config::{ResolvedOptions, Role};
use crate::error::ProxyError;
use crate::http::exchange::RequestHead;

/// Hop-by-hop headers, never relayed as-is.
pub(crate) const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any the `Connection` header names.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in &listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Build the outgoing request to the `role` destination.
///
/// `upgrade` keeps the `Connection`/`Upgrade` pair for the ws pipeline.
pub fn setup_outgoing(
    options: &ResolvedOptions,
    request: &RequestHead,
    role: Role,
    upgrade: bool,
    body: Body,
) -> Result<Request<Body>, ProxyError> {
    let destination = options.destination(role).ok_or(ProxyError::MissingDestination)?;
    let authority = authority(destination);
    let scheme = match destination.scheme() {
        "https" | "wss" => "https",
        _ => "http",
    };
    let uri: Uri = format!("{scheme}://{authority}{}", outgoing_path(options, request, destination))
        .parse()
        .map_err(axum::http::Error::from)?;

    let mut headers = request.headers.clone();
    if upgrade {
        let upgrade_to = headers.get(header::UPGRADE).cloned();
        strip_hop_by_hop(&mut headers);
        if let Some(protocol) = upgrade_to {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }
    } else {
        strip_hop_by_hop(&mut headers);
    }

    if !headers.contains_key(header::HOST) {
        if let Some(original) = request.uri.authority() {
            headers.insert(header::HOST, HeaderValue::from_str(original.as_str()).map_err(axum::http::Error::from)?);
        }
    }

    for (name, value) in &options.headers {
        headers.insert(name.clone(), value.clone());
    }

    if let Some(auth) = &options.auth {
        let value = format!("Basic {}", STANDARD.encode(auth));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&value).map_err(axum::http::Error::from)?,
        );
    }

    if options.change_origin {
        headers.insert(
            header::HOST,
            HeaderValue::from_str(&authority).map_err(axum::http::Error::from)?,
        );
    }

    if let Some(buffer) = &options.buffer {
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(buffer.len()));
    }

    let method = options.method.clone().unwrap_or_else(|| request.method.clone());
    let mut outgoing = Request::builder()
        .method(method)
        .uri(uri)
        .version(Version::HTTP_11)
        .body(body)?;
    *outgoing.headers_mut() = headers;
    Ok(outgoing)
}

/// `host[:port]`, with the port only when it is not the scheme default.
fn authority(destination: &Url) -> String {
    let host = destination.host_str().unwrap_or("localhost");
    match destination.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn outgoing_path(options: &ResolvedOptions, request: &RequestHead, destination: &Url) -> String {
    let target_path = if options.prepend_path {
        match destination.query() {
            Some(query) => format!("{}?{query}", destination.path()),
            None => destination.path().to_string(),
        }
    } else {
        String::new()
    };
    let request_path = if options.ignore_path {
        ""
    } else {
        request.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
    };
    url_join(&target_path, request_path)
}

/// Join two path-and-query strings: paths concatenated with duplicate
/// slashes collapsed, queries kept in order.
pub fn url_join(base: &str, path: &str) -> String {
    let (base_path, base_query) = split_query(base);
    let (request_path, request_query) = split_query(path);

    let mut joined = String::with_capacity(base.len() + path.len() + 1);
    joined.push('/');
    for segment in [base_path, request_path].into_iter().filter(|s| !s.is_empty()) {
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(segment);
    }

    let mut collapsed = String::with_capacity(joined.len());
    for c in joined.chars() {
        if c == '/' && collapsed.ends_with('/') {
            continue;
        }
        collapsed.push(c);
    }

    let queries: Vec<&str> = [base_query, request_query].into_iter().flatten().filter(|q| !q.is_empty()).collect();
    if !queries.is_empty() {
        collapsed.push('?');
        collapsed.push_str(&queries.join("&"));
    }
    collapsed
}

fn split_query(s: &str) -> (&str, Option<&str>) {
    match s.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (s, None),
    }
}
