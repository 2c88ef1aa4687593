use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::info;
use url::Url;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::error::{MediaError, MediaResult};
use crate::models::MediaRecord;
use crate::streamer::DownloadStream;
use crate::worker::FormatSelector;

#[derive(Debug, Deserialize)]
pub struct InfoParams {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    url: Option<String>,
    format_id: Option<String>,
}

/// `GET /api/info?url=…`
pub async fn media_info(
    State(state): State<AppState>,
    Query(params): Query<InfoParams>,
) -> ApiResult<Json<MediaRecord>> {
    let url = params
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL parameter is required"))?;
    validate_url(&url)?;

    let record = state.resolver.resolve(&url).await?;
    Ok(Json(record))
}

/// `GET /api/download?url=…&format_id=…`
///
/// Everything that can fail is checked before the worker starts, so errors
/// still get a proper status. Once headers are out, a failing worker can
/// only truncate the body.
pub async fn download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> ApiResult<Response> {
    let (url, format_id) = match (params.url, params.format_id) {
        (Some(url), Some(format_id)) if !url.is_empty() && !format_id.is_empty() => (url, format_id),
        _ => {
            return Err(ApiError::bad_request(
                "URL and format_id parameters are required",
            ))
        }
    };
    validate_url(&url)?;
    let selector = FormatSelector::parse(&format_id)?;

    // The supervising task logs its own report once the worker exits
    let DownloadStream {
        filename,
        body,
        report: _report,
    } = state.streamer.start(&url, &selector)?;
    info!(url = %url, format = %selector, "📥 Streaming {}", filename);

    let disposition = format!("attachment; filename=\"{}\"", filename);
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_DISPOSITION, disposition),
        (header::TRANSFER_ENCODING, "chunked".to_string()),
    ];

    Ok((headers, Body::from_stream(body)).into_response())
}

/// Only absolute http(s) URLs reach the worker.
fn validate_url(raw: &str) -> MediaResult<()> {
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        Ok(url) => Err(MediaError::client(format!(
            "Unsupported URL scheme: {}",
            url.scheme()
        ))),
        Err(e) => Err(MediaError::client(format!("Invalid URL: {e}"))),
    }
}
