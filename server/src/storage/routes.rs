//! REST endpoints for models.
//!
//! POST /models — multipart upload (optional `format` field, then `model` file field)
//! GET /models — list catalog entries
//! GET /models/{id} — stream the model bytes
//! GET /models/{id}/metadata — catalog entry
//! DELETE /models/{id}
//! GET /storage/status — aggregate view

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use futures_util::TryStreamExt;
use std::io;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::oneshot;
use tokio_util::io::StreamReader;

use super::model::{ModelMetadata, StorageStatus};
use crate::cancel;
use crate::error::{Error, Result};
use crate::routes::ApiResponse;
use crate::state::AppState;

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Content type served for a stored format tag.
pub fn content_type_for(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "gltf" => "model/gltf+json",
        "glb" => "model/gltf-binary",
        "obj" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Lowercase extension of `name`, or empty if it has none.
fn format_from_name(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// POST /models
///
/// The `model` field is streamed into storage as it arrives, so a `format`
/// field only applies when it comes before `model`. Fields after `model` are
/// not read.
pub async fn upload_model(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<ModelMetadata>>> {
    let mut format: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("invalid multipart body: {}", e)))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("model") => {
                let name = field.file_name().unwrap_or("model").to_string();
                let format = format
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| format_from_name(&name));

                let mut reader = StreamReader::new(Box::pin(field.map_err(io::Error::other)));
                let metadata = state
                    .storage
                    .store_model(&name, &format, &mut reader, &cancel::never())
                    .await?;

                return Ok(ApiResponse::ok_with_message("Model stored", metadata));
            }
            Some("format") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::Validation(format!("failed to read format field: {}", e)))?;
                format = Some(value.trim().to_ascii_lowercase());
            }
            _ => {}
        }
    }

    Err(Error::Validation("missing 'model' file field".to_string()))
}

/// GET /models
pub async fn list_models(State(state): State<AppState>) -> Json<ApiResponse<Vec<ModelMetadata>>> {
    ApiResponse::ok(state.storage.list_models().await)
}

/// GET /models/{id}/metadata
pub async fn get_model_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ModelMetadata>>> {
    Ok(ApiResponse::ok(state.storage.get_model_metadata(&id).await?))
}

/// GET /models/{id}
///
/// Chunks are written into one end of an in-memory pipe by a spawned task
/// and the other end is streamed out as the response body. Content-Length is
/// announced up front; if reading a chunk fails partway the body ends with an
/// error so the client sees an aborted transfer instead of a short file.
pub async fn download_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let metadata = state.storage.get_model(&id).await?;

    let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER_SIZE);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let storage = state.storage.clone();
    tokio::spawn(async move {
        let result = storage.stream_model(&id, &mut writer, &cancel::never()).await;
        if let Err(e) = &result {
            tracing::warn!("Streaming model {} failed: {}", id, e);
        }
        // Sent before the writer drops so the reader sees the outcome at EOF.
        let _ = outcome_tx.send(result);
    });

    let headers = [
        (header::CONTENT_TYPE, content_type_for(&metadata.format).to_string()),
        (header::CONTENT_LENGTH, metadata.size.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", metadata.name.replace('"', "")),
        ),
    ];
    let body = BodyPipe {
        reader,
        outcome: outcome_rx,
    };
    Ok((headers, Body::from_stream(body_stream(body))))
}

struct BodyPipe {
    reader: DuplexStream,
    outcome: oneshot::Receiver<Result<()>>,
}

fn body_stream(pipe: BodyPipe) -> impl futures_util::Stream<Item = io::Result<Bytes>> + Send + 'static {
    futures_util::stream::unfold(Some(pipe), |state| async move {
        let mut pipe = state?;
        let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
        match pipe.reader.read(&mut buf).await {
            Ok(0) => match pipe.outcome.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some((Err(io::Error::other(e.to_string())), None)),
                Err(_) => Some((Err(io::Error::other("model stream ended unexpectedly")), None)),
            },
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(pipe)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// DELETE /models/{id}
pub async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    state.storage.delete_model(&id).await?;
    Ok(ApiResponse::message(format!("Model {} deleted", id)))
}

/// GET /storage/status
pub async fn storage_status(State(state): State<AppState>) -> Json<ApiResponse<StorageStatus>> {
    ApiResponse::ok(state.storage.get_status().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("gltf"), "model/gltf+json");
        assert_eq!(content_type_for("GLB"), "model/gltf-binary");
        assert_eq!(content_type_for("obj"), "text/plain");
        assert_eq!(content_type_for("fbx"), "application/octet-stream");
    }

    #[test]
    fn test_format_from_name() {
        assert_eq!(format_from_name("Teapot.OBJ"), "obj");
        assert_eq!(format_from_name("scene.tar.glb"), "glb");
        assert_eq!(format_from_name("README"), "");
    }
}
