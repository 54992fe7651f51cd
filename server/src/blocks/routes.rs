//! REST endpoints for block upload, download and deletion.
//!
//! PUT /blocks — Upload a block (raw binary body)
//! GET /blocks/{hash} — Download a block (returns raw binary)
//! DELETE /blocks/{hash} — Delete a block

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use super::store::ContentAddressedStore;
use crate::error::Result;
use crate::routes::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct BlockUploadResponse {
    pub hash: String,
    pub size: u64,
}

/// PUT /blocks
///
/// Store the raw body as a content-addressed block. The hash is computed by
/// the server; uploading content that already exists returns the same hash.
pub async fn put_block_route(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<BlockUploadResponse>>)> {
    let size = body.len() as u64;
    let hash = state.blocks.store_block(&body).await?;

    Ok((
        StatusCode::CREATED,
        ApiResponse::ok(BlockUploadResponse { hash, size }),
    ))
}

/// GET /blocks/{hash}
///
/// Download a block by its SHA-256 hex hash as `application/octet-stream`.
pub async fn get_block_route(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse> {
    let hash = hash.to_lowercase();
    let block = state.blocks.get_block(&hash).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        block.data,
    ))
}

/// DELETE /blocks/{hash}
pub async fn delete_block_route(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    let hash = hash.to_lowercase();
    state.blocks.delete_block(&hash).await?;
    Ok(ApiResponse::message(format!("Block {} deleted", hash)))
}
