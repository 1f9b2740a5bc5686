use axum::http::{HeaderMap, header};
use url::Url;

const SCHEME_HTTP: &str = "http";
const SCHEME_HTTPS: &str = "https";

/// Host prefixes that identify loopback and private-network addresses.
/// Traffic arriving on these is assumed to be plain-HTTP development use.
const PRIVATE_HOST_PREFIXES: &[&str] = &[
    "localhost",
    "127.",
    "10.",
    "192.168.",
    "172.16.",
    "172.17.",
    "172.18.",
    "172.19.",
    "172.20.",
    "172.21.",
    "172.22.",
    "172.23.",
    "172.24.",
    "172.25.",
    "172.26.",
    "172.27.",
    "172.28.",
    "172.29.",
    "172.30.",
    "172.31.",
];

/// Work out the scheme clients are reaching this proxy with.
///
/// The proxy usually sits behind TLS-terminating infrastructure, so the
/// connection itself says little about the outside scheme. Trust, in
/// order: the X-Forwarded-Proto header, the scheme of the Referer,
/// locally-terminated TLS, and finally the shape of the host (public
/// hosts are assumed to be reached over https, private ones over http).
pub fn resolve_scheme(headers: &HeaderMap, host: &str, local_tls: bool) -> String {
    if let Some(proto) = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
    {
        return proto
            .split(',')
            .next()
            .unwrap_or(proto)
            .trim()
            .to_owned();
    }
    if let Some(referer) = headers
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Url::parse(value).ok())
    {
        return referer.scheme().to_owned();
    }
    if local_tls {
        return SCHEME_HTTPS.to_owned();
    }
    if !PRIVATE_HOST_PREFIXES
        .iter()
        .any(|prefix| host.starts_with(prefix))
    {
        return SCHEME_HTTPS.to_owned();
    }
    SCHEME_HTTP.to_owned()
}

/// The externally-visible origin (`scheme://host`) of this request, used
/// when rewriting absolute upstream URLs to point back at the proxy.
pub fn client_origin(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    // The server never terminates TLS itself.
    format!("{}://{}", resolve_scheme(headers, host, false), host)
}
