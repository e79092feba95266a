//! 测试辅助：内存远端、进程内 WebDAV 服务与流工具。

use async_trait::async_trait;
use axum::Router;
use axum::body::Body as AxumBody;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use dav_server::{DavHandler, fakels::FakeLs, localfs::LocalFs};
use futures_util::stream::{self, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::config::RemoteConfig;
use crate::remote::{ByteStream, RemoteError, RemoteStorage};

pub const DAV_USER: &str = "alice";
pub const DAV_UPLOAD_DIR: &str = "uploads";

pub async fn wait_until_removed(path: &Path) {
    for _ in 0..100 {
        if !path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} was not removed", path.display());
}

pub async fn collect_stream(stream: ByteStream) -> io::Result<Vec<u8>> {
    let chunks: Vec<Bytes> = stream.try_collect().await?;
    Ok(chunks.concat())
}

pub fn bytes_stream(parts: &[&[u8]]) -> ByteStream {
    let parts: Vec<io::Result<Bytes>> = parts
        .iter()
        .map(|part| Ok(Bytes::copy_from_slice(part)))
        .collect();
    Box::pin(stream::iter(parts))
}

pub fn remote_config(base_url: &str) -> RemoteConfig {
    RemoteConfig {
        base_url: base_url.to_string(),
        username: DAV_USER.to_string(),
        password: "app-password".to_string(),
        upload_dir: DAV_UPLOAD_DIR.to_string(),
        folder_timeout: Duration::from_secs(5),
        probe_timeout: Duration::from_secs(5),
        upload_timeout: Duration::from_secs(30),
    }
}

pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// 进程内的 WebDAV 后端，以临时目录为存储。
pub struct DavFixture {
    _temp: TempDir,
    root: PathBuf,
    base_url: String,
}

impl DavFixture {
    pub fn remote_config(&self) -> RemoteConfig {
        remote_config(&self.base_url)
    }

    /// 上传根目录下的本地路径。
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(DAV_UPLOAD_DIR).join(relative)
    }
}

pub async fn spawn_dav_server() -> DavFixture {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_path_buf();
    std::fs::create_dir_all(root.join(DAV_UPLOAD_DIR)).expect("create upload dir");

    let dav = Arc::new(
        DavHandler::builder()
            .strip_prefix(format!("/remote.php/dav/files/{DAV_USER}"))
            .filesystem(LocalFs::new(root.clone(), false, false, false))
            .locksystem(FakeLs::new())
            .build_handler(),
    );
    let app = Router::new().fallback(move |req: Request<AxumBody>| {
        let dav = dav.clone();
        async move { dav.handle(req).await }
    });

    DavFixture {
        _temp: temp,
        root,
        base_url: serve(app).await,
    }
}

/// 对任何请求都返回固定状态码的服务。
pub async fn spawn_status_server(status: StatusCode) -> String {
    let app = Router::new().fallback(move || async move { (status, "backend says no") });
    serve(app).await
}

/// 记录所有调用的内存远端存储。
#[derive(Default)]
pub struct MemoryRemote {
    pub folders: Mutex<BTreeSet<String>>,
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub puts: Mutex<Vec<String>>,
    pub fail_folders: bool,
    pub fail_puts_named: Option<String>,
}

impl MemoryRemote {
    pub fn file(&self, folder: &str, name: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .expect("files lock")
            .get(&format!("{folder}/{name}"))
            .cloned()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.lock().expect("files lock").keys().cloned().collect()
    }

    pub fn put_count(&self) -> usize {
        self.puts.lock().expect("puts lock").len()
    }

    pub fn seed(&self, folder: &str, name: &str, content: &[u8]) {
        self.files
            .lock()
            .expect("files lock")
            .insert(format!("{folder}/{name}"), content.to_vec());
    }
}

#[async_trait]
impl RemoteStorage for MemoryRemote {
    async fn ensure_folder(&self, folder: &str) -> Result<(), RemoteError> {
        if self.fail_folders {
            return Err(RemoteError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "folder create failed".into(),
            });
        }
        self.folders
            .lock()
            .expect("folders lock")
            .insert(folder.to_string());
        Ok(())
    }

    async fn put_file(
        &self,
        folder: &str,
        name: &str,
        content: ByteStream,
        _length: Option<u64>,
    ) -> Result<(), RemoteError> {
        let key = format!("{folder}/{name}");
        self.puts.lock().expect("puts lock").push(key.clone());
        if self.fail_puts_named.as_deref() == Some(name) {
            return Err(RemoteError::Status {
                status: StatusCode::INSUFFICIENT_STORAGE,
                body: "quota exceeded".into(),
            });
        }
        let body = collect_stream(content).await.map_err(|err| RemoteError::Status {
            status: StatusCode::BAD_REQUEST,
            body: err.to_string(),
        })?;
        self.files.lock().expect("files lock").insert(key, body);
        Ok(())
    }

    async fn file_exists(&self, folder: &str, name: &str) -> bool {
        self.file(folder, name).is_some()
    }
}

/// 构造 multipart 请求体。
pub fn multipart_request(uri: &str, fields: &[(&str, &[u8])]) -> Request<AxumBody> {
    const BOUNDARY: &str = "chunkrelayboundary";
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        if *name == "dataFile" {
            body.extend_from_slice(
                b"Content-Disposition: form-data; name=\"dataFile\"; filename=\"blob\"\r\n\
                  Content-Type: application/octet-stream\r\n\r\n",
            );
        } else {
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
        }
        body.extend_from_slice(value);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(AxumBody::from(body))
        .expect("build multipart request")
}

pub async fn response_json(response: axum::response::Response) -> serde_json::Value {
    use http_body_util::BodyExt;
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}
