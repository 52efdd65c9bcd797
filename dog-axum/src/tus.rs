//! tus 1.0 routes over a [`ResumableUploads`] engine.
//!
//! Every engine call runs in its own task: an edge timeout or a dropped
//! connection ends the HTTP exchange but never cancels an append halfway
//! through a storage write.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, HttpBody},
    extract::{OriginalUri, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing, Router,
};
use dog_blob::ByteStream;
use dog_core::errors::DogError;
use dog_tus::{CreateRequest, PatchRequest, ResumableUploads, TusResult};
use futures::TryStreamExt;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::headers::*;
use crate::DogAxumError;

#[derive(Clone)]
pub struct TusState {
    pub uploads: Arc<dyn ResumableUploads>,
}

/// Routes for one upload endpoint, meant to be nested under a base path.
pub fn tus_router(uploads: Arc<dyn ResumableUploads>, request_timeout: Duration) -> Router<()> {
    let state = TusState { uploads };

    Router::new()
        .route("/", routing::post(create_upload).options(describe))
        .route(
            "/{*key}",
            routing::patch(append_upload)
                .head(upload_status)
                .get(upload_status)
                .options(describe),
        )
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::from_fn(tus_headers))
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, UuidRequestId))
        .with_state(state)
}

#[derive(Clone, Copy, Default)]
struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        value(&Uuid::new_v4().to_string()).map(RequestId::new)
    }
}

/// Protocol and CORS headers on every response, errors included.
async fn tus_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_PROTOCOL_VERSION));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOWED_METHODS));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOWED_HEADERS));
    headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static(EXPOSED_HEADERS));
    response
}

async fn describe(State(state): State<TusState>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_VERSION, HeaderValue::from_static(TUS_PROTOCOL_VERSION));
    headers.insert(TUS_MAX_SIZE, HeaderValue::from(state.uploads.config().max_upload_length));
    headers.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    (StatusCode::NO_CONTENT, headers).into_response()
}

async fn create_upload(
    State(state): State<TusState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, DogAxumError> {
    let request = CreateRequest {
        upload_length: header_u64(&headers, &UPLOAD_LENGTH),
        upload_defer_length: header_u64(&headers, &UPLOAD_DEFER_LENGTH),
        content_type: header_str(&headers, &header::CONTENT_TYPE),
        upload_metadata: header_str(&headers, &UPLOAD_METADATA),
        checksum: header_str(&headers, &X_CHECKSUM_SHA256),
    };
    let body = request_body(&headers, body);

    let uploads = Arc::clone(&state.uploads);
    let created = detached(async move { uploads.create(request, body).await }).await?;

    let location = format!("{}/{}", uri.path().trim_end_matches('/'), created.key);
    let mut response = HeaderMap::new();
    response.insert(
        header::LOCATION,
        value(&encode_path(&location)).ok_or_else(|| invalid_header("Location"))?,
    );
    response.insert(UPLOAD_OFFSET, HeaderValue::from(created.upload_offset));
    insert_expires(&mut response, created.expires_at);
    Ok((StatusCode::CREATED, response).into_response())
}

async fn upload_status(State(state): State<TusState>, Path(key): Path<String>) -> Result<Response, DogAxumError> {
    let uploads = Arc::clone(&state.uploads);
    let status = detached(async move { uploads.head(&key).await }).await?;

    let mut response = HeaderMap::new();
    response.insert(UPLOAD_OFFSET, HeaderValue::from(status.upload_offset));
    match status.upload_length {
        Some(length) => response.insert(UPLOAD_LENGTH, HeaderValue::from(length)),
        None => response.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1")),
    };
    insert_expires(&mut response, status.expires_at);
    response.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok((StatusCode::OK, response).into_response())
}

async fn append_upload(
    State(state): State<TusState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, DogAxumError> {
    let request = PatchRequest {
        upload_offset: header_u64(&headers, &UPLOAD_OFFSET),
        upload_length: header_u64(&headers, &UPLOAD_LENGTH),
        content_type: header_str(&headers, &header::CONTENT_TYPE),
    };
    let body = request_body(&headers, body);

    let uploads = Arc::clone(&state.uploads);
    let patched = detached(async move { uploads.patch(&key, request, body).await }).await?;

    let mut response = HeaderMap::new();
    response.insert(UPLOAD_OFFSET, HeaderValue::from(patched.upload_offset));
    insert_expires(&mut response, patched.expires_at);
    Ok((StatusCode::NO_CONTENT, response).into_response())
}

fn request_body(headers: &HeaderMap, body: Body) -> Option<ByteStream> {
    if !declares_body(headers, body.size_hint().exact()) {
        return None;
    }
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    Some(Box::pin(stream))
}

fn insert_expires(headers: &mut HeaderMap, at: chrono::DateTime<chrono::Utc>) {
    if let Some(expires) = value(&http_date(at)) {
        headers.insert(UPLOAD_EXPIRES, expires);
    }
}

fn invalid_header(name: &str) -> DogAxumError {
    DogError::general_error(format!("Could not encode {name} header")).into_anyhow().into()
}

/// Run an engine call to completion even if the caller goes away.
async fn detached<T, F>(op: F) -> Result<T, DogAxumError>
where
    F: Future<Output = TusResult<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(op).await {
        Ok(result) => result.map_err(DogAxumError::from),
        Err(e) => Err(anyhow::Error::new(e).context("upload task failed").into()),
    }
}
