//! HTTP API routes: upload boundary, catalog status and the reader contract.

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{
        header::{
            AUTHORIZATION, CACHE_CONTROL, CONTENT_SECURITY_POLICY, CONTENT_TYPE, ETAG,
            IF_NONE_MATCH, X_CONTENT_TYPE_OPTIONS,
        },
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use bytes::Bytes;
use subtle::ConstantTimeEq;

use book_pipeline_core::catalog::BookRecord;
use book_pipeline_core::error::{ErrorKind, IngestError, ServeError};
use book_pipeline_core::id::{BookId, UserId};
use book_pipeline_core::ingest::IngestReport;
use book_pipeline_core::serve::{Served, CACHE_CONTROL as READ_CACHE_CONTROL};
use book_pipeline_core::upload::UploadedAsset;

use crate::AppState;

/// Header carrying the caller identity issued by the authentication layer.
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the original upload filename.
pub const FILENAME_HEADER: &str = "x-filename";

const CHAPTER_CSP: &str = "default-src 'none'; img-src 'self'; style-src 'self'; \
                           base-uri 'none'; form-action 'none'; frame-ancestors 'self'";
const RESOURCE_CSP: &str = "default-src 'none'; style-src 'self'; sandbox";
const JSON_CSP: &str = "default-src 'none'; frame-ancestors 'none'";

pub fn routes(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.limits.max_upload_bytes.saturating_add(1))
        .unwrap_or(usize::MAX);
    Router::new()
        .route("/api/books/:book_id", put(put_book))
        .route("/api/books/:book_id/status", get(book_status))
        .route("/api/books/:book_id/toc", get(table_of_contents))
        .route("/api/books/:book_id/chapters/:chapter_id", get(chapter))
        .route("/api/books/:book_id/resources/*path", get(resource))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn put_book(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestReport>, ApiError> {
    require_admin(&state, &headers)?;
    let book_id = parse_book_id(&book_id)?;
    let filename = header_str(&headers, FILENAME_HEADER)
        .map(decode_filename)
        .ok_or_else(|| ApiError::BadRequest("missing X-Filename header".to_string()))?;
    let upload = UploadedAsset {
        filename,
        media_type: header_str(&headers, CONTENT_TYPE.as_str()).map(str::to_string),
        bytes: body.to_vec(),
    };

    let ingestor = state.ingestor.clone();
    let report = tokio::task::spawn_blocking(move || ingestor.ingest(&book_id, upload, None))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(report))
}

async fn book_status(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<BookRecord>, ApiError> {
    require_admin(&state, &headers)?;
    let book_id = parse_book_id(&book_id)?;
    let record = state
        .catalog
        .get(&book_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::Serve(ServeError::NotFound(format!("book {book_id}"))))?;
    Ok(Json(record))
}

async fn table_of_contents(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = caller(&headers)?;
    let book_id = parse_book_id(&book_id)?;
    let served = state.content.table_of_contents(&user, &book_id).await?;
    let body = serde_json::to_vec(&served.body).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(respond(
        &headers,
        Served {
            body,
            media_type: served.media_type,
            etag: served.etag,
        },
        JSON_CSP,
    ))
}

async fn chapter(
    State(state): State<AppState>,
    Path((book_id, chapter_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = caller(&headers)?;
    let book_id = parse_book_id(&book_id)?;
    let served = state.content.chapter(&user, &book_id, &chapter_id).await?;
    Ok(respond(&headers, served, CHAPTER_CSP))
}

async fn resource(
    State(state): State<AppState>,
    Path((book_id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = caller(&headers)?;
    let book_id = parse_book_id(&book_id)?;
    let served = state.content.resource(&user, &book_id, &path).await?;
    Ok(respond(&headers, served, RESOURCE_CSP))
}

/// Build the read response, or 304 when the client already has this entity.
fn respond(request: &HeaderMap, served: Served<Vec<u8>>, csp: &'static str) -> Response {
    let mut response = if etag_matches(request, &served.etag) {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        let content_type = HeaderValue::from_str(&served.media_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        ([(CONTENT_TYPE, content_type)], served.body).into_response()
    };

    let headers = response.headers_mut();
    if let Ok(etag) = HeaderValue::from_str(&served.etag) {
        headers.insert(ETAG, etag);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(READ_CACHE_CONTROL));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(CONTENT_SECURITY_POLICY, HeaderValue::from_static(csp));
    response
}

fn etag_matches(request: &HeaderMap, etag: &str) -> bool {
    let Some(value) = header_str(request, IF_NONE_MATCH.as_str()) else {
        return false;
    };
    value.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate == etag || candidate.strip_prefix("W/") == Some(etag)
    })
}

fn caller(headers: &HeaderMap) -> Result<UserId, ApiError> {
    let raw = header_str(headers, USER_HEADER)
        .ok_or(ApiError::Unauthorized("missing X-User-Id header"))?;
    UserId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.config.admin_token else {
        return Ok(());
    };
    let presented = header_str(headers, AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token_matches(token, expected) => Ok(()),
        _ => Err(ApiError::Unauthorized("admin token required")),
    }
}

fn token_matches(presented: &str, expected: &str) -> bool {
    bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

fn parse_book_id(raw: &str) -> Result<BookId, ApiError> {
    BookId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Filenames may arrive percent-encoded so non-ASCII names survive headers.
fn decode_filename(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

#[derive(Debug)]
pub enum ApiError {
    Ingest(IngestError),
    Serve(ServeError),
    Unauthorized(&'static str),
    BadRequest(String),
    Internal(String),
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        ApiError::Ingest(e)
    }
}

impl From<ServeError> for ApiError {
    fn from(e: ServeError) -> Self {
        ApiError::Serve(e)
    }
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Ingest(e) => e.kind(),
            ApiError::Serve(e) => e.kind(),
            ApiError::Unauthorized(_) | ApiError::BadRequest(_) => ErrorKind::InvalidRequest,
            ApiError::Internal(_) => ErrorKind::PersistenceFailure,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => status_for(self.kind()),
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::PayloadTooLarge | ErrorKind::EntryTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::UnsafeArchive
        | ErrorKind::MalformedPackage
        | ErrorKind::SanitizationLimitExceeded
        | ErrorKind::ExtractionTimeout => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::PersistenceFailure => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = %self.kind(), error = %self, "request failed");
        } else {
            tracing::debug!(kind = %self.kind(), error = %self, "request rejected");
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Ingest(e) => write!(f, "{}", e),
            ApiError::Serve(e) => write!(f, "{}", e),
            ApiError::Unauthorized(s) => write!(f, "unauthorized: {}", s),
            ApiError::BadRequest(s) => write!(f, "bad request: {}", s),
            ApiError::Internal(s) => write!(f, "internal error: {}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_matching() {
        let mut headers = HeaderMap::new();
        assert!(!etag_matches(&headers, "\"abc\""));
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"x\", W/\"abc\""));
        assert!(etag_matches(&headers, "\"abc\""));
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"x\""));
        assert!(!etag_matches(&headers, "\"abc\""));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::EntryTooLarge), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(status_for(ErrorKind::UnsupportedFormat), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(status_for(ErrorKind::ExtractionTimeout), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            ApiError::Unauthorized("x").status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_token_comparison() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cre", "s3cret"));
        assert!(!token_matches("s3creT", "s3cret"));
        assert!(!token_matches("", "s3cret"));
    }

    #[test]
    fn test_filename_decoding() {
        assert_eq!(decode_filename("caf%C3%A9.epub"), "café.epub");
        assert_eq!(decode_filename("plain.txt"), "plain.txt");
    }
}
