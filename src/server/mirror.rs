use crate::server::{
    cache::{CachedEntry, MirrorCache},
    http_client::{self, FetchError, HttpClient},
    routes::ErrorResponse,
};
use axum::{
    Json,
    body::{Body, Bytes},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::{convert::Infallible, sync::Arc};
use tracing::{debug, warn};
use url::Url;

pub const MIRROR_CACHE_HEADER: &str = "x-mirror-cache";
pub const MIRROR_CACHE_HIT: &str = "HIT";
pub const MIRROR_CACHE_MISS: &str = "MISS";

/// A transformation applied to an in-flight upstream response.
///
/// Hooks run in registration order and mutate the body buffer and content
/// type in place; whatever state they leave behind is what gets cached
/// and written to the client.
pub trait MirrorHook: Send + Sync {
    fn apply(&self, content_type: &mut String, body: &mut Vec<u8>);
}

/// Rewrites every occurrence of one base URL inside the response body
/// with another, so upstream references point back at this proxy.
pub struct RewriteBaseUrl {
    pub from: String,
    pub to: String,
}

impl MirrorHook for RewriteBaseUrl {
    fn apply(&self, _content_type: &mut String, body: &mut Vec<u8>) {
        *body = replace_all(body, self.from.as_bytes(), self.to.as_bytes());
    }
}

/// One mirrored request: a target upstream URL bound to the cache store
/// of its upstream family, plus any body transformations to apply.
pub struct Mirror {
    url: Url,
    cache: Arc<MirrorCache>,
    pre_hooks: Vec<Box<dyn MirrorHook>>,
    post_hooks: Vec<Box<dyn MirrorHook>>,
}

impl Mirror {
    pub fn new(url: Url, cache: Arc<MirrorCache>) -> Self {
        Self {
            url,
            cache,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    /// Register a hook that runs after a miss is confirmed but before the
    /// upstream fetch.
    #[allow(dead_code)]
    pub fn with_pre_hook(mut self, hook: impl MirrorHook + 'static) -> Self {
        self.pre_hooks.push(Box::new(hook));
        self
    }

    /// Register a hook that runs after a successful fetch, before the
    /// result is cached and written out.
    pub fn with_post_hook(mut self, hook: impl MirrorHook + 'static) -> Self {
        self.post_hooks.push(Box::new(hook));
        self
    }

    /// Serve the mirrored resource, from cache when possible.
    ///
    /// A cache hit replays the stored bytes without touching the upstream
    /// or any hook. On a miss the upstream is fetched exactly once, post
    /// hooks rewrite the body, and the result is cached unless a
    /// concurrent request for the same key got there first. A miss
    /// response whose body is never delivered removes the entry it just
    /// inserted, so the cache only holds responses that at least one
    /// client has received.
    pub async fn respond(self, client: &HttpClient) -> Response {
        let key = self.url.to_string();

        if let Some(entry) = self.cache.get(&key) {
            debug!(key = %key, "serving from cache");
            return cached_response(&entry);
        }

        let mut content_type = String::new();
        let mut body = Vec::new();
        for hook in &self.pre_hooks {
            hook.apply(&mut content_type, &mut body);
        }

        match http_client::fetch(client, &self.url).await {
            Ok(fetched) => {
                debug!(
                    url = %self.url,
                    content_length = fetched.content_length,
                    "fetched upstream"
                );
                content_type = fetched.content_type;
                body = fetched.body;
            }
            Err(FetchError::NotFound) => {
                return error_response(StatusCode::NOT_FOUND, "Resource not found.");
            }
            Err(FetchError::Timeout) => {
                warn!(url = %self.url, "upstream request timed out");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Upstream request timed out.",
                );
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, "upstream fetch failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to fetch the resource.",
                );
            }
        }

        for hook in &self.post_hooks {
            hook.apply(&mut content_type, &mut body);
        }

        let body = Bytes::from(body);
        // A concurrent request may have populated the key while this one
        // was fetching; the first writer wins.
        let inserted = !self.cache.contains(&key)
            && self.cache.put(
                &key,
                CachedEntry {
                    content_type: content_type.clone(),
                    body: body.clone(),
                },
            );
        let rollback = inserted.then(|| CacheRollback {
            cache: Arc::clone(&self.cache),
            key,
            armed: true,
        });

        miss_response(&content_type, body, rollback)
    }
}

/// Removes a just-inserted cache entry unless the response body made it
/// out to the client. Held inside the miss body stream: dropping the
/// stream before it completes fires the rollback.
struct CacheRollback {
    cache: Arc<MirrorCache>,
    key: String,
    armed: bool,
}

impl CacheRollback {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CacheRollback {
    fn drop(&mut self) {
        if self.armed {
            warn!(key = %self.key, "response write failed, dropping cache entry");
            self.cache.remove(&self.key);
        }
    }
}

fn cached_response(entry: &CachedEntry) -> Response {
    let mut response = Response::new(Body::from(entry.body.clone()));
    let headers = response.headers_mut();
    headers.insert(
        MIRROR_CACHE_HEADER,
        HeaderValue::from_static(MIRROR_CACHE_HIT),
    );
    headers.insert(header::CONTENT_TYPE, content_type_value(&entry.content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.body.len()));
    response
}

fn miss_response(content_type: &str, body: Bytes, rollback: Option<CacheRollback>) -> Response {
    let length = body.len();
    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(body);
        // Only reached once the chunk has been handed off to the client;
        // dropping the stream earlier leaves the guard armed.
        if let Some(rollback) = rollback {
            rollback.disarm();
        }
    };
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        MIRROR_CACHE_HEADER,
        HeaderValue::from_static(MIRROR_CACHE_MISS),
    );
    headers.insert(header::CONTENT_TYPE, content_type_value(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    response
}

fn content_type_value(content_type: &str) -> HeaderValue {
    HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

fn error_response(status: StatusCode, message: &'static str) -> Response {
    (status, Json(ErrorResponse { message })).into_response()
}

/// Replace every occurrence of `from` in `haystack` with `to`.
fn replace_all(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    if from.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(position) = rest.windows(from.len()).position(|window| window == from) {
        out.extend_from_slice(&rest[..position]);
        out.extend_from_slice(to);
        rest = &rest[position + from.len()..];
    }
    out.extend_from_slice(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::http_client::{BuildHttpClientArgs, build_http_client};
    use http_body_util::BodyExt;
    use std::{
        num::NonZeroUsize,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    struct CountingHook(Arc<AtomicUsize>);

    impl MirrorHook for CountingHook {
        fn apply(&self, _content_type: &mut String, _body: &mut Vec<u8>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_cache() -> Arc<MirrorCache> {
        Arc::new(MirrorCache::new(
            NonZeroUsize::new(8).unwrap(),
            Duration::from_secs(60),
        ))
    }

    fn test_client(timeout: Duration) -> HttpClient {
        build_http_client(BuildHttpClientArgs {
            request_timeout: timeout,
            proxy: None,
        })
        .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn replace_all_handles_repeats_and_absence() {
        assert_eq!(replace_all(b"aXbXc", b"X", b"--"), b"a--b--c".to_vec());
        assert_eq!(replace_all(b"plain", b"X", b"Y"), b"plain".to_vec());
        assert_eq!(replace_all(b"abc", b"", b"Y"), b"abc".to_vec());
    }

    #[tokio::test]
    async fn miss_fetches_once_and_populates_cache() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.js"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("console.log(1)", "text/javascript"),
            )
            .expect(1)
            .mount(&upstream)
            .await;

        let url = Url::parse(&format!("{}/file.js", upstream.uri())).unwrap();
        let cache = test_cache();
        let response = Mirror::new(url.clone(), Arc::clone(&cache))
            .respond(&test_client(Duration::from_secs(5)))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(MIRROR_CACHE_HEADER).unwrap(),
            MIRROR_CACHE_MISS
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/javascript"
        );
        assert_eq!(body_bytes(response).await, Bytes::from("console.log(1)"));
        assert!(cache.contains(url.as_str()));
    }

    #[tokio::test]
    async fn hit_skips_upstream_and_hooks() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&upstream)
            .await;

        let url = Url::parse(&format!("{}/cached.js", upstream.uri())).unwrap();
        let cache = test_cache();
        cache.put(
            url.as_str(),
            CachedEntry {
                content_type: "text/javascript".to_owned(),
                body: Bytes::from("cached"),
            },
        );

        let hook_calls = Arc::new(AtomicUsize::new(0));
        let response = Mirror::new(url, Arc::clone(&cache))
            .with_pre_hook(CountingHook(Arc::clone(&hook_calls)))
            .with_post_hook(CountingHook(Arc::clone(&hook_calls)))
            .respond(&test_client(Duration::from_secs(5)))
            .await;

        assert_eq!(
            response.headers().get(MIRROR_CACHE_HEADER).unwrap(),
            MIRROR_CACHE_HIT
        );
        assert_eq!(body_bytes(response).await, Bytes::from("cached"));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upstream_not_found_passes_through_and_is_never_cached() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&upstream)
            .await;

        let url = Url::parse(&format!("{}/missing.js", upstream.uri())).unwrap();
        let cache = test_cache();
        let response = Mirror::new(url.clone(), Arc::clone(&cache))
            .respond(&test_client(Duration::from_secs(5)))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!cache.contains(url.as_str()));
    }

    #[tokio::test]
    async fn upstream_error_status_maps_to_generic_fetch_failure() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&upstream)
            .await;

        let url = Url::parse(&format!("{}/flaky", upstream.uri())).unwrap();
        let cache = test_cache();
        let response = Mirror::new(url.clone(), Arc::clone(&cache))
            .respond(&test_client(Duration::from_secs(5)))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!cache.contains(url.as_str()));
    }

    #[tokio::test]
    async fn upstream_timeout_maps_to_timeout_failure() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&upstream)
            .await;

        let url = Url::parse(&format!("{}/slow", upstream.uri())).unwrap();
        let cache = test_cache();
        let response = Mirror::new(url.clone(), Arc::clone(&cache))
            .respond(&test_client(Duration::from_millis(100)))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_bytes(response).await;
        assert!(std::str::from_utf8(&body).unwrap().contains("timed out"));
        assert!(!cache.contains(url.as_str()));
    }

    #[tokio::test]
    async fn post_hook_rewrite_applies_to_response_and_cache() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"<script src="https://assets.example/embed.js"></script>"#,
                "text/html",
            ))
            .mount(&upstream)
            .await;

        let url = Url::parse(&format!("{}/page", upstream.uri())).unwrap();
        let cache = test_cache();
        let response = Mirror::new(url.clone(), Arc::clone(&cache))
            .with_post_hook(RewriteBaseUrl {
                from: "https://assets.example/".to_owned(),
                to: "https://mirror.test/githubassets/".to_owned(),
            })
            .respond(&test_client(Duration::from_secs(5)))
            .await;

        let rewritten = r#"<script src="https://mirror.test/githubassets/embed.js"></script>"#;
        assert_eq!(body_bytes(response).await, Bytes::from(rewritten));
        assert_eq!(cache.get(url.as_str()).unwrap().body, Bytes::from(rewritten));
    }

    #[tokio::test]
    async fn post_hooks_run_in_registration_order() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("alpha", "text/plain"))
            .mount(&upstream)
            .await;

        let url = Url::parse(&format!("{}/chain", upstream.uri())).unwrap();
        let response = Mirror::new(url, test_cache())
            .with_post_hook(RewriteBaseUrl {
                from: "alpha".to_owned(),
                to: "beta".to_owned(),
            })
            .with_post_hook(RewriteBaseUrl {
                from: "beta".to_owned(),
                to: "gamma".to_owned(),
            })
            .respond(&test_client(Duration::from_secs(5)))
            .await;

        assert_eq!(body_bytes(response).await, Bytes::from("gamma"));
    }

    #[tokio::test]
    async fn dropped_miss_response_rolls_back_cache_entry() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("payload", "text/plain"))
            .mount(&upstream)
            .await;

        let url = Url::parse(&format!("{}/undelivered", upstream.uri())).unwrap();
        let cache = test_cache();
        let response = Mirror::new(url.clone(), Arc::clone(&cache))
            .respond(&test_client(Duration::from_secs(5)))
            .await;

        assert!(cache.contains(url.as_str()));
        // Dropping the response without polling the body simulates a
        // client that went away before the write completed.
        drop(response);
        assert!(!cache.contains(url.as_str()));
    }

    #[tokio::test]
    async fn delivered_miss_response_keeps_cache_entry() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("payload", "text/plain"))
            .mount(&upstream)
            .await;

        let url = Url::parse(&format!("{}/delivered", upstream.uri())).unwrap();
        let cache = test_cache();
        let response = Mirror::new(url.clone(), Arc::clone(&cache))
            .respond(&test_client(Duration::from_secs(5)))
            .await;

        assert_eq!(body_bytes(response).await, Bytes::from("payload"));
        assert!(cache.contains(url.as_str()));
    }
}
