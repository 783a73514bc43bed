//! Object request handlers
//!
//! Each handler builds one lifecycle controller for the addressed object and
//! drives it on the blocking pool, since every volume call may wait on the
//! filesystem.

use crate::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};
use volstore_common::{Error, ObjectPath, ObjectState, meta, renormalize_timestamp, timestamp_of};
use volstore_storage::{ObjectFile, ObjectMetadata};

const IO_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the blocking reader and the response body
const BODY_CHANNEL_DEPTH: usize = 4;

type BodySender = mpsc::Sender<volstore_common::Result<Bytes>>;

/// `/{device}/{account}/{container}/{object}`
type ObjectParams = (String, String, String, String);

/// Handler failure rendered as a plain-text response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = StatusCode::from_u16(err.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.to_string())
    }
}

impl From<task::JoinError> for ApiError {
    fn from(err: task::JoinError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("storage task failed: {err}"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{} {}", self.status, self.message);
        } else {
            debug!("{} {}", self.status, self.message);
        }
        (self.status, self.message).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Run storage work on the blocking pool
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> volstore_common::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(task::spawn_blocking(f).await??)
}

fn disk_file(
    state: &AppState,
    params: ObjectParams,
) -> volstore_common::Result<Box<dyn ObjectFile>> {
    let (device, account, container, object) = params;
    let path = ObjectPath::new(account, container, object)?;
    state.registry.disk_file(&device, path)
}

fn existing_file(
    state: &AppState,
    params: ObjectParams,
) -> volstore_common::Result<Box<dyn ObjectFile>> {
    let file = disk_file(state, params)?;
    if file.object_state() == ObjectState::NotExists {
        return Err(Error::NotFound(file.path().to_string()));
    }
    Ok(file)
}

/// Health check handler
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.registry.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "NO DEVICES")
    } else {
        (StatusCode::OK, "OK")
    }
}

/// Get object (GET /{device}/{account}/{container}/{object})
///
/// The body is streamed from the open handle, so memory use per request is
/// bounded by the channel depth whatever the object size.
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(params): Path<ObjectParams>,
) -> ApiResult<Response> {
    let (file, metadata, size) = blocking(move || open_object(&state, params)).await?;

    let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
    task::spawn_blocking(move || stream_body(file, size, &tx));

    let body = Body::from_stream(ReceiverStream::new(rx));
    Ok((StatusCode::OK, object_headers(&metadata, size), body).into_response())
}

/// Head object (HEAD /{device}/{account}/{container}/{object})
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    Path(params): Path<ObjectParams>,
) -> ApiResult<Response> {
    let (metadata, size) = blocking(move || {
        let (mut file, metadata, size) = open_object(&state, params)?;
        file.close()?;
        Ok((metadata, size))
    })
    .await?;

    Ok((StatusCode::OK, object_headers(&metadata, size)).into_response())
}

/// Open an object for reading along with its metadata and the size of the
/// opened handle
fn open_object(
    state: &AppState,
    params: ObjectParams,
) -> volstore_common::Result<(Box<dyn ObjectFile>, ObjectMetadata, u64)> {
    let mut file = existing_file(state, params)?;
    file.open()?;
    let metadata = file.metadata()?;
    let size = file.handle_stat()?.size;
    Ok((file, metadata, size))
}

/// Send `size` bytes of an open object down the response body channel
fn stream_body(mut file: Box<dyn ObjectFile>, size: u64, tx: &BodySender) {
    let mut remaining = size;
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let chunk = match file.read(&mut buf[..want]) {
            Ok(0) => {
                warn!("{} ended {} bytes early", file.path(), remaining);
                tx.blocking_send(Err(Error::internal(format!(
                    "{} truncated while reading",
                    file.path()
                ))))
                .ok();
                break;
            }
            Ok(n) => {
                remaining -= n as u64;
                Bytes::copy_from_slice(&buf[..n])
            }
            Err(e) => {
                error!("Read of {} failed: {}", file.path(), e);
                tx.blocking_send(Err(e)).ok();
                break;
            }
        };
        if tx.blocking_send(Ok(chunk)).is_err() {
            debug!("Client went away while reading {}", file.path());
            break;
        }
    }
    if let Err(e) = file.close() {
        warn!("Failed to close {}: {}", file.path(), e);
    }
}

/// Put object (PUT /{device}/{account}/{container}/{object})
pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path(params): Path<ObjectParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let metadata = request_metadata(&headers);
    let expected_etag = header_str(&headers, header::ETAG.as_str())
        .map(|etag| etag.trim_matches('"').to_ascii_lowercase());

    let committed = blocking(move || {
        let mut file = disk_file(&state, params)?;
        file.create(Some(body.len() as u64))?;
        for chunk in body.chunks(IO_CHUNK_SIZE) {
            file.write(chunk)?;
        }

        if let Some(expected) = expected_etag {
            let actual = file.written_etag()?;
            if expected != actual {
                warn!(
                    "ETag mismatch on {}: client sent {}, body hashes to {}",
                    file.path(),
                    expected,
                    actual
                );
                file.abort()?;
                return Ok(None);
            }
        }

        file.put_metadata(metadata)?;
        file.commit().map(Some)
    })
    .await?;

    let Some(metadata) = committed else {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "ETag does not match request body",
        ));
    };

    let mut headers = HeaderMap::new();
    if let Some(etag) = metadata.etag() {
        insert_header(&mut headers, meta::ETAG, etag);
    }
    Ok((StatusCode::CREATED, headers).into_response())
}

/// Delete object (DELETE /{device}/{account}/{container}/{object})
///
/// Deleting an absent object succeeds, whether it was missing at
/// initialisation or vanished before the unlink.
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Path(params): Path<ObjectParams>,
) -> ApiResult<StatusCode> {
    blocking(move || {
        let mut file = disk_file(&state, params)?;
        if file.object_state() == ObjectState::NotExists {
            debug!("Delete of absent {}", file.path());
            return Ok(());
        }
        match file.delete() {
            Err(e) if e.is_not_found() => {
                debug!("{} removed concurrently", file.path());
                Ok(())
            }
            other => other,
        }
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Metadata supplied with a PUT
fn request_metadata(headers: &HeaderMap) -> ObjectMetadata {
    let mut metadata = ObjectMetadata::new();

    if let Some(content_type) = header_str(headers, header::CONTENT_TYPE.as_str()) {
        metadata.insert(meta::CONTENT_TYPE, content_type);
    }

    let timestamp = header_str(headers, "x-timestamp")
        .and_then(renormalize_timestamp)
        .unwrap_or_else(|| timestamp_of(SystemTime::now()));
    metadata.insert(meta::TIMESTAMP, timestamp);

    let prefix = meta::USER_META_PREFIX.to_ascii_lowercase();
    for (name, value) in headers {
        let Some(suffix) = name.as_str().strip_prefix(prefix.as_str()) else {
            continue;
        };
        if suffix.is_empty() {
            continue;
        }
        match value.to_str() {
            Ok(value) => {
                let key = format!("{}{}", meta::USER_META_PREFIX, title_case(suffix));
                metadata.insert(key, value);
            }
            Err(_) => warn!("Ignoring non-ASCII value for {}", name),
        }
    }
    metadata
}

/// `content-md5` -> `Content-Md5`
fn title_case(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            })
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Response headers describing an object whose open handle holds `size` bytes
fn object_headers(metadata: &ObjectMetadata, size: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(
        &mut headers,
        meta::CONTENT_TYPE,
        metadata.content_type().unwrap_or(meta::DEFAULT_CONTENT_TYPE),
    );
    insert_header(&mut headers, meta::CONTENT_LENGTH, &size.to_string());
    for key in [meta::ETAG, meta::TIMESTAMP] {
        if let Some(value) = metadata.get(key) {
            insert_header(&mut headers, key, value);
        }
    }
    for (key, value) in metadata.user_metadata() {
        insert_header(&mut headers, key, value);
    }
    headers
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!("Metadata {} cannot be sent as a header", name),
    }
}
