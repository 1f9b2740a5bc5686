use crate::server::{AppState, mirror::Mirror};
use axum::{
    extract::{Path, State},
    response::Response,
};
use std::sync::Arc;
use url::Url;

pub const RAW_UPSTREAM: &str = "https://raw.githubusercontent.com/";

/// Mirrors raw user-content files verbatim.
pub async fn raw_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Response {
    let mut url = Url::parse(RAW_UPSTREAM).expect("raw upstream URL should be valid");
    url.set_path(&format!("/{path}"));

    Mirror::new(url, Arc::clone(&state.caches.raw))
        .respond(&state.http_client)
        .await
}
