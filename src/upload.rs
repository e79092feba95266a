//! 上传接口：会话登记、分片接收与合并完成。

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json, Multipart};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;
use crate::finalize::{FinalizeRequest, Uploader};
use crate::sessions::Submitter;

#[derive(Debug)]
pub struct UploadConfig {
    pub chunk_max_size: u64,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct SessionRequest {
    session_id: String,
    email: String,
    phone: String,
    data_origin: String,
    total_files: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionResponse {
    message: &'static str,
    session_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct CompleteRequest {
    upload_id: String,
    file_name: String,
    email: String,
    phone: String,
    data_origin: String,
    session_id: Option<String>,
    total_files: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompleteResponse {
    message: &'static str,
    folder_name: String,
    file_name: String,
}

/// 登记多文件上传会话。
pub async fn open_session(
    Extension(uploader): Extension<Arc<Uploader>>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<JsonResponse<SessionResponse>, ApiError> {
    let Json(payload) = payload?;
    let session_id = payload.session_id.trim().to_string();
    if session_id.is_empty() {
        return Err(ApiError::BadRequest("sessionId is required.".into()));
    }

    uploader
        .open_session(
            &session_id,
            payload.total_files,
            Submitter {
                email: payload.email,
                phone: payload.phone,
                data_origin: payload.data_origin,
            },
        )
        .await;

    Ok(JsonResponse(SessionResponse {
        message: "Upload session registered successfully",
        session_id,
    }))
}

/// 接收单个分片（multipart：`dataFile`、`uploadId`、`chunkIndex`）。
pub async fn upload_chunk(
    Extension(uploader): Extension<Arc<Uploader>>,
    Extension(config): Extension<Arc<UploadConfig>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, &'static str), ApiError> {
    let mut multipart = multipart?;
    let mut data: Option<Vec<u8>> = None;
    let mut upload_id: Option<String> = None;
    let mut chunk_index: Option<String> = None;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "dataFile" => {
                let mut buffer = Vec::new();
                while let Some(bytes) = field.chunk().await? {
                    if (buffer.len() + bytes.len()) as u64 > config.chunk_max_size {
                        return Err(ApiError::BadRequest(
                            "Could not parse form. Chunk might be too large.".into(),
                        ));
                    }
                    buffer.extend_from_slice(&bytes);
                }
                data = Some(buffer);
            }
            "uploadId" => upload_id = Some(field.text().await?),
            "chunkIndex" => chunk_index = Some(field.text().await?),
            _ => debug!(field = name, "ignoring unknown form field"),
        }
    }

    let data = data.ok_or_else(|| ApiError::BadRequest("Invalid file chunk key.".into()))?;
    let upload_id = upload_id.unwrap_or_default();
    let index = chunk_index
        .as_deref()
        .map(str::trim)
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| ApiError::BadRequest("Invalid chunk index.".into()))?;

    uploader.store_chunk(&upload_id, index, &data).await?;
    Ok((StatusCode::OK, "Chunk uploaded successfully"))
}

/// 合并分片并上传到远端存储。
pub async fn complete_upload(
    Extension(uploader): Extension<Arc<Uploader>>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<JsonResponse<CompleteResponse>, ApiError> {
    let Json(payload) = payload?;
    debug!(
        upload_id = payload.upload_id,
        session_id = payload.session_id.as_deref().unwrap_or_default(),
        total_files = payload.total_files.unwrap_or(1),
        "finalize requested"
    );

    let finalized = uploader
        .finalize(FinalizeRequest {
            upload_id: payload.upload_id,
            file_name: payload.file_name,
            submitter: Submitter {
                email: payload.email,
                phone: payload.phone,
                data_origin: payload.data_origin,
            },
            session_id: payload.session_id,
        })
        .await?;

    Ok(JsonResponse(CompleteResponse {
        message: "File uploaded successfully!",
        folder_name: finalized.folder,
        file_name: finalized.file_name,
    }))
}
