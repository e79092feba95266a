//! 内嵌的上传表单页面。

use axum::http::{HeaderMap, HeaderValue, Uri, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "frontend"]
/// 嵌入式前端资源。
pub struct FrontendAssets;

/// 返回上传表单。
pub async fn serve_form() -> Result<Response, ApiError> {
    load_embedded_asset("index.html")?
        .ok_or_else(|| ApiError::Internal("upload form missing from build".into()))
}

/// 其余 GET 请求按静态资源处理。
pub async fn serve_asset(uri: Uri) -> Result<Response, ApiError> {
    let path = uri.path().trim_start_matches('/');
    match load_embedded_asset(path)? {
        Some(response) => Ok(response),
        None => Ok((axum::http::StatusCode::NOT_FOUND, "not found").into_response()),
    }
}

/// 加载指定路径的嵌入式资源。
fn load_embedded_asset(path: &str) -> Result<Option<Response>, ApiError> {
    let Some(asset) = FrontendAssets::get(path) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    Ok(Some((headers, asset.data.into_owned()).into_response()))
}
