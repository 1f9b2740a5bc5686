use anyhow::Result;
use reqwest::{Proxy, StatusCode, header};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub type HttpClient = reqwest::Client;

/// Fixed identifying user-agent sent with every upstream request.
const USER_AGENT: &str = "Mirror (+https://github.com/flxxyz/mirror)";

pub struct BuildHttpClientArgs {
    pub request_timeout: Duration,
    pub proxy: Option<Proxy>,
}

/// Create a new [`HttpClient`] with the given arguments.
pub fn build_http_client(args: BuildHttpClientArgs) -> Result<HttpClient> {
    let mut builder = reqwest::ClientBuilder::default()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(5))
        .timeout(args.request_timeout);
    if let Some(proxy) = args.proxy {
        builder = builder.proxy(proxy);
    }
    Ok(builder.build()?)
}

/// Ways an upstream fetch can fail, each mapped to a different
/// client-facing response by the mirror.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream resource not found")]
    NotFound,
    #[error("upstream returned status {0}")]
    UpstreamStatus(StatusCode),
    #[error("upstream request timed out or was cancelled")]
    Timeout,
    #[error("failed to reach upstream")]
    Transport(#[source] reqwest::Error),
    #[error("failed to read upstream body")]
    Read(#[source] reqwest::Error),
}

/// A complete upstream response body together with the header metadata
/// the mirror re-serves.
#[derive(Debug)]
pub struct FetchedContent {
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
}

/// Perform the single upstream GET for a mirror request.
///
/// Only a 200 response counts as success. A 404 is reported separately
/// from other statuses so it can be passed through to the client as-is.
pub async fn fetch(client: &HttpClient, url: &Url) -> Result<FetchedContent, FetchError> {
    let response = client.get(url.as_str()).send().await.map_err(|err| {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err)
        }
    })?;

    match response.status() {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
        status => return Err(FetchError::UpstreamStatus(status)),
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let content_length = response.content_length();
    let body = response.bytes().await.map_err(|err| {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Read(err)
        }
    })?;

    Ok(FetchedContent {
        content_type,
        content_length,
        body: body.to_vec(),
    })
}
