//! 统一的 API 错误类型与转换。

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use crate::chunks::ChunkError;
use crate::remote::RemoteError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, JsonResponse(json!({ "error": message }))).into_response()
    }
}

impl From<ChunkError> for ApiError {
    fn from(error: ChunkError) -> Self {
        match error {
            ChunkError::InvalidId => ApiError::BadRequest("Invalid upload ID.".into()),
            ChunkError::InvalidIndex(name) => {
                warn!(chunk = %name, "non-conforming chunk name");
                ApiError::BadRequest("Invalid chunk index.".into())
            }
            ChunkError::NotFound => {
                ApiError::Internal("Could not find chunks on server.".into())
            }
            ChunkError::Io(err) => {
                error!(error = %err, "chunk storage failure");
                ApiError::Internal("Error processing chunks.".into())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        warn!(error = %rejection, "rejected json body");
        ApiError::BadRequest("Invalid JSON body.".into())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        warn!(error = %rejection, "rejected multipart body");
        ApiError::BadRequest("Could not parse form. Chunk might be too large.".into())
    }
}

impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        warn!(error = %error, "malformed multipart field");
        ApiError::BadRequest("Could not parse form. Chunk might be too large.".into())
    }
}

/// 远端错误细节只写日志，返回给客户端的是固定文案。
pub fn remote_failure(context: &'static str, error: RemoteError) -> ApiError {
    error!(error = %error, "{context}");
    ApiError::Internal(context.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::response_json;
    use std::io;

    #[tokio::test]
    async fn errors_render_as_json() {
        let response = ApiError::BadRequest("Invalid upload ID.".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response_json(response).await;
        assert_eq!(body["error"], "Invalid upload ID.");
    }

    #[tokio::test]
    async fn storage_details_are_not_exposed() {
        let error: ApiError = ChunkError::Io(io::Error::other("disk /var/secret full")).into();
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response_json(response).await;
        assert_eq!(body["error"], "Error processing chunks.");
    }

    #[test]
    fn remote_failures_use_generic_message() {
        let error = remote_failure(
            "Failed to upload file.",
            RemoteError::InvalidUrl("http://internal".into()),
        );
        assert!(matches!(error, ApiError::Internal(msg) if msg == "Failed to upload file."));
    }
}
