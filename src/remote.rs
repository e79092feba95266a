//! WebDAV 远端存储客户端：建目录、流式上传与存在性探测。

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Method, StatusCode, Url};
use std::fmt;
use std::io;
use std::pin::Pin;
use tracing::{debug, warn};

use crate::config::RemoteConfig;

/// 一次性消费的字节流，用于向远端上传。
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug)]
pub enum RemoteError {
    InvalidUrl(String),
    Transport(reqwest::Error),
    Status { status: StatusCode, body: String },
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::InvalidUrl(url) => write!(f, "invalid remote url: {url}"),
            RemoteError::Transport(err) => write!(f, "request execution failed: {err}"),
            RemoteError::Status { status, body } => {
                write!(f, "bad response from remote: {status} (body: {body})")
            }
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Transport(err)
    }
}

/// 远端存储操作；路径均相对于配置的上传根目录。
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// 创建目录，已存在视为成功。
    async fn ensure_folder(&self, folder: &str) -> Result<(), RemoteError>;

    /// 流式上传文件，`length` 已知时携带 Content-Length。
    async fn put_file(
        &self,
        folder: &str,
        name: &str,
        content: ByteStream,
        length: Option<u64>,
    ) -> Result<(), RemoteError>;

    /// 探测文件是否存在；任何错误都按不存在处理。
    async fn file_exists(&self, folder: &str, name: &str) -> bool;
}

/// 基于 reqwest 的 WebDAV 客户端。
pub struct WebDavClient {
    http: Client,
    root: Url,
    root_segments: Vec<String>,
    username: String,
    password: String,
    mkcol: Method,
    config: RemoteConfig,
}

impl WebDavClient {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let root = Url::parse(&config.base_url)
            .map_err(|_| RemoteError::InvalidUrl(config.base_url.clone()))?;
        if root.cannot_be_a_base() {
            return Err(RemoteError::InvalidUrl(config.base_url.clone()));
        }
        let mut root_segments = vec![
            "remote.php".to_string(),
            "dav".to_string(),
            "files".to_string(),
            config.username.clone(),
        ];
        root_segments.extend(
            config
                .upload_dir
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string),
        );
        let mkcol = Method::from_bytes(b"MKCOL")
            .map_err(|_| RemoteError::InvalidUrl("MKCOL".into()))?;
        let http = Client::builder().connect_timeout(config.folder_timeout).build()?;

        Ok(Self {
            http,
            root,
            root_segments,
            username: config.username.clone(),
            password: config.password.clone(),
            mkcol,
            config,
        })
    }

    /// 拼接远端地址，每个路径段单独转义。
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.root.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidUrl(self.root.to_string()))?
            .pop_if_empty()
            .extend(&self.root_segments)
            .extend(segments);
        Ok(url)
    }

    async fn check_status(
        response: reqwest::Response,
        accepted: &[StatusCode],
    ) -> Result<(), RemoteError> {
        let status = response.status();
        if accepted.contains(&status) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status { status, body })
    }
}

#[async_trait]
impl RemoteStorage for WebDavClient {
    async fn ensure_folder(&self, folder: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&[folder])?;
        let response = self
            .http
            .request(self.mkcol.clone(), url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.config.folder_timeout)
            .send()
            .await?;
        // 405 表示目录已存在
        Self::check_status(
            response,
            &[StatusCode::CREATED, StatusCode::METHOD_NOT_ALLOWED],
        )
        .await?;
        debug!(folder, "remote folder ready");
        Ok(())
    }

    async fn put_file(
        &self,
        folder: &str,
        name: &str,
        content: ByteStream,
        length: Option<u64>,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&[folder, name])?;
        let mut request = self
            .http
            .put(url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.config.upload_timeout);
        if let Some(length) = length {
            request = request.header(CONTENT_LENGTH, length);
        }
        let response = request.body(Body::wrap_stream(content)).send().await?;
        Self::check_status(response, &[StatusCode::CREATED, StatusCode::NO_CONTENT]).await?;
        debug!(folder, name, "remote file stored");
        Ok(())
    }

    async fn file_exists(&self, folder: &str, name: &str) -> bool {
        let url = match self.endpoint(&[folder, name]) {
            Ok(url) => url,
            Err(err) => {
                warn!(folder, name, error = %err, "existence probe skipped");
                return false;
            }
        };
        let result = self
            .http
            .head(url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.config.probe_timeout)
            .send()
            .await;
        match result {
            Ok(response) => response.status() == StatusCode::OK,
            Err(err) => {
                warn!(folder, name, error = %err, "existence probe failed");
                false
            }
        }
    }
}
