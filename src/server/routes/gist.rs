use crate::server::{
    AppState,
    mirror::{Mirror, RewriteBaseUrl},
    origin,
    routes::{ASSETS_UPSTREAM, ErrorResponse},
};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use std::sync::Arc;
use url::Url;

pub const GIST_UPSTREAM: &str = "https://gist.github.com/";

/// Mirrors embeddable gist scripts, rewriting their asset references so
/// they load through the `/githubassets` mirror instead of the upstream
/// CDN.
pub async fn gist_handler(
    State(state): State<Arc<AppState>>,
    Path((username, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    // Only the .js embed format is served; everything else on the gist
    // host is not meant to be mirrored.
    if !std::path::Path::new(&filename)
        .extension()
        .is_some_and(|extension| extension == "js")
    {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                message: "Only .js gist embeds can be mirrored.",
            }),
        ));
    }

    let mut url = Url::parse(GIST_UPSTREAM).expect("gist upstream URL should be valid");
    url.set_path(&format!("/{username}/{filename}"));

    let assets_base = format!("{}/githubassets/", origin::client_origin(&headers));
    Ok(Mirror::new(url, Arc::clone(&state.caches.gist))
        .with_post_hook(RewriteBaseUrl {
            from: ASSETS_UPSTREAM.to_owned(),
            to: assets_base,
        })
        .respond(&state.http_client)
        .await)
}
