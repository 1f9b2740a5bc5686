use crate::server::{AppState, mirror::Mirror, origin};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use std::sync::Arc;
use url::Url;

pub const DOUYU_UPSTREAM: &str = "https://open.douyucdn.cn/";

/// Mirrors the Douyu room API. Entries are extremely short-lived because
/// the room payload carries near-real-time stream state.
pub async fn douyu_room_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Response {
    let mut url = Url::parse(DOUYU_UPSTREAM).expect("douyu upstream URL should be valid");
    url.set_path(&format!("/api/RoomApi/room/{room_id}"));

    Mirror::new(url, Arc::clone(&state.caches.douyu))
        .respond(&state.http_client)
        .await
}

/// Permanent redirect from the pre-prefix room API path to the mirrored
/// one, kept for clients that still use the old URL shape.
pub async fn douyu_legacy_redirect_handler(
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let location = format!(
        "{}/douyu/api/RoomApi/room/{room_id}",
        origin::client_origin(&headers)
    );
    Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .expect("redirect response should always build")
}
