use crate::server::{AppState, mirror::Mirror};
use axum::{
    extract::{Path, State},
    response::Response,
};
use std::sync::Arc;
use url::Url;

pub const ASSETS_UPSTREAM: &str = "https://github.githubassets.com/";

/// Mirrors static assets referenced by rewritten gist embeds.
///
/// Only the source directory and the final path segment are meaningful
/// to the upstream; anything in between is discarded, matching the URLs
/// that gist embeds reference.
pub async fn assets_handler(
    State(state): State<Arc<AppState>>,
    Path((src, rest)): Path<(String, String)>,
) -> Response {
    let filename = rest.rsplit('/').next().unwrap_or(rest.as_str());
    let mut url = Url::parse(ASSETS_UPSTREAM).expect("assets upstream URL should be valid");
    url.set_path(&format!("/{src}/{filename}"));

    Mirror::new(url, Arc::clone(&state.caches.assets))
        .respond(&state.http_client)
        .await
}
