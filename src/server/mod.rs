//! A small mirroring proxy that re-serves a fixed set of upstream hosts
//! under its own path prefixes, with a short-lived response cache per
//! upstream family.

mod cache;
mod http_client;
mod mirror;
mod origin;
mod routes;

use anyhow::Result;
use axum::{
    Router,
    extract::Request,
    http::{HeaderValue, header},
    middleware::{self as axum_middleware, Next},
    response::Response,
    routing::get,
};
use cache::MirrorCache;
use core::{net::SocketAddr, time::Duration};
use http_client::{BuildHttpClientArgs, HttpClient, build_http_client};
use reqwest::Proxy;
use std::{num::NonZeroUsize, sync::Arc};
use tokio::{net::TcpListener, signal};
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{self, TraceLayer},
};
use tracing::{Level, info};
use url::Url;

const MAX_REQUEST_BODY_BYTES: usize = 1024;
const CACHE_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

pub struct Server {
    router_inner: Router,
    caches: Caches,
}

/// Settings to run the mirror server with.
#[derive(Debug, Clone)]
pub struct Settings {
    /// How long a request may take end to end before it is abandoned.
    pub request_timeout: Duration,

    /// Forward proxy to route all upstream fetches through.
    pub upstream_proxy: Option<Url>,
}

/// One response cache per upstream family, sized for how quickly that
/// upstream's content goes stale: the livestream room API is nearly
/// real-time, while the asset CDN is effectively immutable.
#[derive(Clone)]
struct Caches {
    gist: Arc<MirrorCache>,
    assets: Arc<MirrorCache>,
    raw: Arc<MirrorCache>,
    douyu: Arc<MirrorCache>,
}

impl Caches {
    fn new() -> Self {
        Self {
            gist: Arc::new(MirrorCache::new(
                const { NonZeroUsize::new(512).unwrap() },
                Duration::from_secs(60),
            )),
            assets: Arc::new(MirrorCache::new(
                const { NonZeroUsize::new(16).unwrap() },
                Duration::from_secs(30 * 60),
            )),
            raw: Arc::new(MirrorCache::new(
                const { NonZeroUsize::new(128).unwrap() },
                Duration::from_secs(60),
            )),
            douyu: Arc::new(MirrorCache::new(
                const { NonZeroUsize::new(512).unwrap() },
                Duration::from_secs(1),
            )),
        }
    }
}

struct AppState {
    http_client: HttpClient,
    caches: Caches,
}

impl Server {
    /// Create a new server with the provided settings.
    pub fn new(settings: Settings) -> Result<Self> {
        let caches = Caches::new();
        let router = Router::new()
            .route("/", get(routes::index_handler))
            .route("/gist/{username}/{filename}", get(routes::gist_handler))
            .route("/githubassets/{src}/{*rest}", get(routes::assets_handler))
            .route("/githubraw/{*path}", get(routes::raw_handler))
            .route(
                "/douyu/api/RoomApi/room/{room_id}",
                get(routes::douyu_room_handler),
            )
            .route(
                "/api/RoomApi/room/{room_id}",
                get(routes::douyu_legacy_redirect_handler),
            )
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                    .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
            )
            .layer(TimeoutLayer::new(settings.request_timeout))
            .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
            .layer(NormalizePathLayer::trim_trailing_slash())
            .layer(CatchPanicLayer::new())
            .layer(CorsLayer::permissive())
            .layer(CompressionLayer::new())
            .layer(axum_middleware::from_fn(Self::header_middleware))
            .with_state(Arc::new(AppState {
                http_client: build_http_client(BuildHttpClientArgs {
                    request_timeout: settings.request_timeout,
                    proxy: settings
                        .upstream_proxy
                        .as_ref()
                        .map(|p| Proxy::all(p.as_str()))
                        .transpose()?,
                })?,
                caches: caches.clone(),
            }));

        Ok(Self {
            router_inner: router,
            caches,
        })
    }

    /// Start the server and expose it locally on the provided [`SocketAddr`].
    pub async fn start(self, address: &SocketAddr) -> Result<()> {
        tokio::spawn(Self::cache_monitor(self.caches.clone()));
        let tcp_listener = TcpListener::bind(&address).await?;
        info!("Listening on http://{}", tcp_listener.local_addr()?);
        axum::serve(tcp_listener, self.router_inner)
            .with_graceful_shutdown(Self::shutdown_signal())
            .await?;
        Ok(())
    }

    /// Periodically reports per-family cache occupancy.
    async fn cache_monitor(caches: Caches) {
        let mut interval = tokio::time::interval(CACHE_MONITOR_INTERVAL);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            info!(
                gist = caches.gist.len(),
                githubassets = caches.assets.len(),
                githubraw = caches.raw.len(),
                douyu = caches.douyu.len(),
                "cache occupancy"
            );
        }
    }

    // https://github.com/tokio-rs/axum/blob/15917c6dbcb4a48707a20e9cfd021992a279a662/examples/graceful-shutdown/src/main.rs#L55
    async fn shutdown_signal() {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    async fn header_middleware(request: Request, next: Next) -> Response {
        let mut response = next.run(request).await;
        let headers = response.headers_mut();
        headers.append(
            header::SERVER,
            HeaderValue::from_static(env!("CARGO_PKG_NAME")),
        );
        headers.append(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=86400, immutable"),
        );
        headers.append(
            "Cross-Origin-Resource-Policy",
            HeaderValue::from_static("cross-origin"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn test_server() -> Server {
        Server::new(Settings {
            request_timeout: Duration::from_secs(5),
            upstream_proxy: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn index_serves_embedded_page() {
        let response = test_server()
            .router_inner
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=86400, immutable"
        );
    }

    #[tokio::test]
    async fn gist_rejects_non_js_files() {
        let response = test_server()
            .router_inner
            .oneshot(
                Request::builder()
                    .uri("/gist/someone/notes.md")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn legacy_room_path_redirects_permanently() {
        let response = test_server()
            .router_inner
            .oneshot(
                Request::builder()
                    .uri("/api/RoomApi/room/288016")
                    .header(header::HOST, "mirror.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://mirror.example/douyu/api/RoomApi/room/288016"
        );
    }
}
