use crate::{
    error::{AppError, Result},
    library::{FileReference, FolderCustomization, FolderIndex, LibraryIndex, Rating},
    media::get_mime_type,
    metadata::read_image_metadata,
    state::AppState,
};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use headers::{ETag, HeaderMapExt, IfNoneMatch};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

const WAIT_FOR_UPDATE_SUFFIX: &str = "/wait-for-update";
const METADATA_SUFFIX: &str = "/metadata";
const RATE_SUFFIX: &str = "/rate";

pub async fn log_requests(request: Request, next: Next) -> Response {
    info!("{} {}", request.method(), request.uri());
    next.run(request).await
}

pub async fn root_handler() -> &'static str {
    "imgshelf image library server"
}

#[derive(Debug, Default, Deserialize)]
pub struct VersionQuery {
    pub longpoll: Option<String>,
}

/// Plain-text version tag. With `?longpoll=...` the answer is held back so a
/// client polling in a loop notices a restart without hammering the server.
pub async fn version_tag_handler(
    State(state): State<AppState>,
    Query(query): Query<VersionQuery>,
) -> impl IntoResponse {
    if query.longpoll.as_deref().is_some_and(|v| !v.is_empty()) {
        tokio::time::sleep(state.config.version_poll_delay()).await;
    }
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.version_tag.to_string(),
    )
}

pub async fn list_libraries(State(state): State<AppState>) -> Result<Response> {
    Ok(Json(state.library.list()?).into_response())
}

pub async fn reload_libraries(State(state): State<AppState>) -> Result<Response> {
    let library = state.library.clone();
    let listing = run_blocking(move || {
        library.reload()?;
        library.list()
    })
    .await?;
    Ok(Json(listing).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeleteRequest {
    pub library: Option<String>,
    pub file: Option<String>,
}

pub async fn delete_file(
    State(state): State<AppState>,
    payload: std::result::Result<Json<DeleteRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let Json(request) = payload.map_err(invalid_payload)?;
    let (Some(library_id), Some(file)) = (request.library, request.file) else {
        return Err(AppError::validation("Invalid payload: library and file required"));
    };

    let library = state.library.clone();
    run_blocking(move || library.delete(&library_id, &file)).await?;
    Ok(StatusCode::OK)
}

pub async fn get_customizations(State(state): State<AppState>) -> Result<Response> {
    Ok(Json(state.library.customizations().load()?).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomizationRequest {
    pub folder_path: Option<String>,
    pub display_name: Option<String>,
    pub icon: Option<String>,
}

pub async fn set_customization(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CustomizationRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let Json(request) = payload.map_err(invalid_payload)?;
    let folder_path = request.folder_path.unwrap_or_default();
    state.library.set_customization(
        &folder_path,
        FolderCustomization {
            display_name: request.display_name,
            icon: request.icon,
        },
    )?;
    Ok(StatusCode::OK)
}

pub async fn remove_customization(
    State(state): State<AppState>,
    Path(folder_path): Path<String>,
) -> Result<StatusCode> {
    state.library.remove_customization(&folder_path)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub ratings: Option<String>,
    pub recursive: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LibraryFiles {
    pub name: String,
    pub files: Vec<FileReference>,
}

/// `GET /libs/{*rest}`. Library ids may contain `/`, so the tail of the path
/// decides between long-poll, listing, metadata and the image itself.
pub async fn libs_get_handler(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let rest = rest.trim_end_matches('/');

    if let Some(library_id) = rest.strip_suffix(WAIT_FOR_UPDATE_SUFFIX) {
        if let Some(folder) = state.library.folder(library_id) {
            let outcome = folder.wait_for_update().await;
            debug!(
                "wait-for-update {} resolved: timeout={} changed={}",
                library_id, outcome.timeout, outcome.changed
            );
            return Ok(Json(outcome).into_response());
        }
    }

    if let Some(folder) = state.library.folder(rest) {
        return list_library(&state, folder, &query, &headers).await;
    }

    if let Some(target) = rest.strip_suffix(METADATA_SUFFIX) {
        if let Some((folder, file)) = split_library_path(&state.library, target) {
            let path = folder.resolve_file(&file)?;
            let metadata = run_blocking(move || read_image_metadata(&path)).await?;
            return Ok(Json(metadata).into_response());
        }
    }

    match split_library_path(&state.library, rest) {
        Some((folder, file)) => serve_image(&folder, &file, &headers).await,
        None => Err(AppError::not_found("Library not found")),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RateRequest {
    pub img: Option<String>,
    pub rating: Option<serde_json::Value>,
}

/// `POST /libs/{library}/rate`
pub async fn libs_post_handler(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    payload: std::result::Result<Json<RateRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let Some(library_id) = rest.trim_end_matches('/').strip_suffix(RATE_SUFFIX) else {
        return Err(AppError::not_found("Not found"));
    };
    let folder = state.library.require_folder(library_id)?;

    let Json(request) = payload.map_err(invalid_payload)?;
    let img = request
        .img
        .filter(|img| !img.is_empty())
        .ok_or_else(|| AppError::validation("Invalid payload"))?;
    let value = request
        .rating
        .as_ref()
        .and_then(|rating| {
            rating
                .as_i64()
                .or_else(|| rating.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        })
        .ok_or_else(|| AppError::validation("Invalid payload"))?;
    let rating = Rating::try_from(value)?;

    folder.rate(&img, rating.value())?;
    Ok(StatusCode::OK)
}

async fn list_library(
    state: &AppState,
    folder: Arc<FolderIndex>,
    query: &ListQuery,
    headers: &HeaderMap,
) -> Result<Response> {
    let filter = query.ratings.as_deref().and_then(Rating::parse_filter);
    let recursive = query.recursive.as_deref() == Some("true");
    let if_none_match = headers.typed_get::<IfNoneMatch>();
    let ratings = state.library.ratings().clone();

    run_blocking(move || {
        folder.refresh_if_stale()?;
        let filter_key = match &filter {
            Some(filter) => filter.iter().map(Rating::to_string).collect::<Vec<_>>().join("."),
            None => "all".to_string(),
        };

        // The cached timestamp only covers the folder itself, so nested
        // listings are walked up front and fingerprinted.
        let (files, tree_fingerprint) = if recursive {
            let files = folder.list(filter.as_ref(), true)?;
            let fingerprint = listing_fingerprint(&files);
            (Some(files), Some(fingerprint))
        } else {
            (None, None)
        };

        let etag = listing_etag(
            folder.last_changed_millis(),
            &filter_key,
            tree_fingerprint,
            ratings.revision(),
        )?;

        if let Some(if_none_match) = &if_none_match {
            if !if_none_match.precondition_passes(&etag) {
                let mut response = StatusCode::NOT_MODIFIED.into_response();
                response.headers_mut().typed_insert(etag);
                return Ok(response);
            }
        }

        let files = match files {
            Some(files) => files,
            None => folder.list(filter.as_ref(), false)?,
        };
        let mut response = Json(LibraryFiles {
            name: folder.name().to_string(),
            files,
        })
        .into_response();
        response.headers_mut().typed_insert(etag);
        Ok(response)
    })
    .await
}

/// `tree_fingerprint` is `None` for flat listings.
fn listing_etag(
    last_changed: u64,
    filter_key: &str,
    tree_fingerprint: Option<u64>,
    revision: u64,
) -> Result<ETag> {
    let scope = match tree_fingerprint {
        Some(fingerprint) => format!("tree{:016x}", fingerprint),
        None => "flat".to_string(),
    };
    format!("\"{}-{}-{}-{}\"", last_changed, filter_key, scope, revision)
        .parse::<ETag>()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid ETag: {:?}", e)))
}

fn listing_fingerprint(files: &[FileReference]) -> u64 {
    let mut hasher = DefaultHasher::new();
    files.len().hash(&mut hasher);
    for file in files {
        file.file.hash(&mut hasher);
    }
    hasher.finish()
}

/// Split `rest` into the longest registered library id and the file below it.
fn split_library_path(library: &LibraryIndex, rest: &str) -> Option<(Arc<FolderIndex>, String)> {
    rest.rmatch_indices('/')
        .map(|(index, _)| index)
        .find_map(|index| {
            let (library_id, file) = (&rest[..index], &rest[index + 1..]);
            if file.is_empty() {
                return None;
            }
            library
                .folder(library_id)
                .map(|folder| (folder, file.to_string()))
        })
}

async fn serve_image(folder: &FolderIndex, file: &str, headers: &HeaderMap) -> Result<Response> {
    let path = folder.resolve_file(file)?;
    let file_size = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Err(AppError::not_found("File not found")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::not_found("File not found"))
        }
        Err(e) => return Err(AppError::Io(e)),
    };

    let mut file = File::open(&path).await?;

    let mut response_builder = Response::builder()
        .header(header::CONTENT_TYPE, get_mime_type(&path))
        .header(header::ACCEPT_RANGES, "bytes");

    if file_size == 0 {
        return Ok(response_builder
            .header(header::CONTENT_LENGTH, 0)
            .status(StatusCode::OK)
            .body(Body::empty())?);
    }

    let (start, end) = if let Some(range_header) = headers.get(header::RANGE) {
        let range_str = range_header.to_str().map_err(|_| AppError::InvalidRange)?;
        debug!("Received range request: {}", range_str);
        parse_range_header(range_str, file_size)?
    } else {
        (0, file_size - 1)
    };

    let len = end - start + 1;

    let response_status = if len < file_size {
        response_builder = response_builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, file_size),
        );
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    response_builder = response_builder.header(header::CONTENT_LENGTH, len);

    file.seek(std::io::SeekFrom::Start(start)).await?;
    let stream = ReaderStream::with_capacity(file.take(len), 64 * 1024);
    let body = Body::from_stream(stream);

    Ok(response_builder.status(response_status).body(body)?)
}

/// Parse the first range of a `bytes=` header against a non-empty file.
pub(crate) fn parse_range_header(range_str: &str, file_size: u64) -> Result<(u64, u64)> {
    let range_part = range_str.strip_prefix("bytes=").ok_or(AppError::InvalidRange)?;
    let first_range = range_part.split(',').next().ok_or(AppError::InvalidRange)?.trim();
    let (start_str, end_str) = first_range.split_once('-').ok_or(AppError::InvalidRange)?;

    let (start, end) = if start_str.is_empty() {
        // Suffix range like "-500" (last 500 bytes)
        let suffix_len: u64 = end_str.parse().map_err(|_| AppError::InvalidRange)?;
        if suffix_len == 0 {
            return Err(AppError::InvalidRange);
        }
        (file_size.saturating_sub(suffix_len), file_size - 1)
    } else {
        let start: u64 = start_str.parse().map_err(|_| AppError::InvalidRange)?;
        let end = if end_str.is_empty() {
            file_size - 1
        } else {
            let parsed_end: u64 = end_str.parse().map_err(|_| AppError::InvalidRange)?;
            parsed_end.min(file_size - 1)
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(AppError::InvalidRange);
    }
    Ok((start, end))
}

fn invalid_payload(rejection: JsonRejection) -> AppError {
    AppError::validation(format!("Invalid payload: {}", rejection.body_text()))
}

async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Blocking task failed: {}", e)))?
}
