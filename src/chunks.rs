//! 分片暂存区：上传标识校验、分片写入、枚举与清理。

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_SEGMENT_LEN: usize = 255;

#[derive(Debug)]
pub enum ChunkError {
    InvalidId,
    InvalidIndex(String),
    NotFound,
    Io(io::Error),
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::InvalidId => write!(f, "invalid upload id"),
            ChunkError::InvalidIndex(name) => write!(f, "invalid chunk index: {name}"),
            ChunkError::NotFound => write!(f, "no chunks found"),
            ChunkError::Io(err) => write!(f, "chunk storage error: {err}"),
        }
    }
}

impl From<io::Error> for ChunkError {
    fn from(err: io::Error) -> Self {
        ChunkError::Io(err)
    }
}

/// 将不可信输入规范化为单个安全的路径段。
///
/// 含有 `..` 段或绝对路径的输入直接拒绝，其余取最后一段。
pub fn sanitize_segment(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_SEGMENT_LEN
        || trimmed.starts_with(['/', '\\'])
        || trimmed.chars().any(char::is_control)
    {
        return None;
    }
    if trimmed.as_bytes().get(1) == Some(&b':') {
        return None;
    }

    let parts: Vec<&str> = trimmed
        .split(['/', '\\'])
        .filter(|part| !part.is_empty())
        .collect();
    if parts.contains(&"..") {
        return None;
    }
    let base = *parts.last()?;
    if base == "." {
        return None;
    }
    Some(base.to_string())
}

/// 已校验的上传标识，可安全作为暂存区目录名。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadId(String);

impl UploadId {
    pub fn parse(raw: &str) -> Result<Self, ChunkError> {
        sanitize_segment(raw)
            .map(UploadId)
            .ok_or(ChunkError::InvalidId)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 按上传标识划分的本地分片暂存区。
#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    #[cfg(test)]
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn scratch_dir(&self, upload_id: &UploadId) -> PathBuf {
        self.root.join(upload_id.as_str())
    }

    /// 写入单个分片；先写隐藏临时文件再原子改名。
    pub async fn store_chunk(
        &self,
        upload_id: &UploadId,
        index: u64,
        content: &[u8],
    ) -> Result<(), ChunkError> {
        let dir = self.scratch_dir(upload_id);
        fs::create_dir_all(&dir).await?;

        let target = dir.join(index.to_string());
        let temp_path = dir.join(format!(".{index}.tmp.{}", Uuid::new_v4()));
        let write_result: io::Result<()> = async {
            let mut file = File::create(&temp_path).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &target).await
        }
        .await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        debug!(
            upload_id = upload_id.as_str(),
            index,
            bytes = content.len(),
            "chunk stored"
        );
        Ok(())
    }

    /// 列出已写入的分片，按数字索引升序返回。
    pub async fn list_chunks(&self, upload_id: &UploadId) -> Result<Vec<(u64, PathBuf)>, ChunkError> {
        let dir = self.scratch_dir(upload_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(ChunkError::NotFound),
            Err(err) => return Err(err.into()),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let index = name
                .parse::<u64>()
                .map_err(|_| ChunkError::InvalidIndex(name.to_string()))?;
            chunks.push((index, entry.path()));
        }

        if chunks.is_empty() {
            return Err(ChunkError::NotFound);
        }
        chunks.sort_by_key(|(index, _)| *index);
        Ok(chunks)
    }

    /// 获取暂存区的作用域守卫，守卫释放时删除整个目录。
    pub fn scratch(&self, upload_id: &UploadId) -> Scratch {
        Scratch {
            upload_id: upload_id.clone(),
            dir: Some(self.scratch_dir(upload_id)),
        }
    }

    /// 删除暂存区，失败只记录日志。
    pub async fn purge(&self, upload_id: &UploadId) {
        remove_scratch(upload_id.as_str().to_string(), self.scratch_dir(upload_id)).await;
    }

    /// 清理超过 ttl 未修改的暂存目录。
    pub async fn sweep_stale(&self, ttl: Duration) -> io::Result<usize> {
        if ttl.is_zero() || fs::metadata(&self.root).await.is_err() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let Some(age) = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
            else {
                continue;
            };
            if age < ttl {
                continue;
            }
            let name = entry.file_name();
            let Ok(upload_id) = UploadId::parse(&name.to_string_lossy()) else {
                continue;
            };
            self.purge(&upload_id).await;
            info!(upload_id = upload_id.as_str(), "removed stale scratch dir");
            removed += 1;
        }
        Ok(removed)
    }
}

/// 暂存区作用域守卫。
///
/// 正常路径上调用 [`Scratch::release`] 等待删除完成；
/// 未释放就被丢弃时（例如请求被取消）在后台删除。
#[derive(Debug)]
pub struct Scratch {
    upload_id: UploadId,
    dir: Option<PathBuf>,
}

impl Scratch {
    pub fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }

    /// 删除暂存目录并等待完成。
    pub async fn release(mut self) {
        if let Some(dir) = self.dir.take() {
            remove_scratch(self.upload_id.as_str().to_string(), dir).await;
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let upload_id = self.upload_id.as_str().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_scratch_dir(&upload_id, &dir));
            }
            Err(_) => remove_scratch_dir(&upload_id, &dir),
        }
    }
}

async fn remove_scratch(upload_id: String, dir: PathBuf) {
    let task = tokio::task::spawn_blocking(move || remove_scratch_dir(&upload_id, &dir));
    if let Err(err) = task.await {
        warn!(error = %err, "scratch removal task failed");
    }
}

fn remove_scratch_dir(upload_id: &str, dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!(upload_id, "scratch purged"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(upload_id, error = %err, "failed to purge scratch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wait_until_removed;
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, ChunkStore) {
        let temp = tempdir().expect("tempdir");
        let store = ChunkStore::new(temp.path().join("scratch"));
        (temp, store)
    }

    #[test]
    fn sanitize_rejects_traversal_and_absolute() {
        for raw in [
            "",
            "   ",
            ".",
            "..",
            "../etc",
            "a/../../b",
            "..\\windows",
            "/etc/passwd",
            "\\share",
            "C:\\temp",
            "a/b/..",
            "bad\0id",
        ] {
            assert_eq!(sanitize_segment(raw), None, "{raw:?} should be rejected");
        }
    }

    #[test]
    fn sanitize_keeps_base_component() {
        assert_eq!(sanitize_segment("abc-123").as_deref(), Some("abc-123"));
        assert_eq!(sanitize_segment("nested/dir/file.bin").as_deref(), Some("file.bin"));
        assert_eq!(sanitize_segment("trailing/").as_deref(), Some("trailing"));
        assert_eq!(sanitize_segment("./report.pdf").as_deref(), Some("report.pdf"));
    }

    #[tokio::test]
    async fn invalid_id_touches_nothing() {
        let (_temp, store) = make_store();
        assert!(matches!(UploadId::parse("../x"), Err(ChunkError::InvalidId)));
        assert!(fs::metadata(store.root_path()).await.is_err());
    }

    #[tokio::test]
    async fn list_chunks_orders_numerically() {
        let (_temp, store) = make_store();
        let id = UploadId::parse("upload-1").expect("id");
        for index in [10u64, 2, 0, 1] {
            store
                .store_chunk(&id, index, index.to_string().as_bytes())
                .await
                .expect("store chunk");
        }

        let chunks = store.list_chunks(&id).await.expect("list chunks");
        let indices: Vec<u64> = chunks.iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, vec![0, 1, 2, 10]);
    }

    #[tokio::test]
    async fn list_chunks_missing_area_is_not_found() {
        let (_temp, store) = make_store();
        let id = UploadId::parse("nothing-here").expect("id");
        assert!(matches!(store.list_chunks(&id).await, Err(ChunkError::NotFound)));
    }

    #[tokio::test]
    async fn list_chunks_rejects_foreign_names() {
        let (_temp, store) = make_store();
        let id = UploadId::parse("upload-2").expect("id");
        store.store_chunk(&id, 0, b"a").await.expect("store chunk");
        std::fs::write(store.root_path().join("upload-2").join("zero"), b"x").expect("write");

        let result = store.list_chunks(&id).await;
        assert!(matches!(result, Err(ChunkError::InvalidIndex(name)) if name == "zero"));
    }

    #[tokio::test]
    async fn list_chunks_ignores_in_flight_temp_files() {
        let (_temp, store) = make_store();
        let id = UploadId::parse("upload-3").expect("id");
        store.store_chunk(&id, 0, b"a").await.expect("store chunk");
        std::fs::write(store.root_path().join("upload-3").join(".1.tmp.x"), b"x").expect("write");

        let chunks = store.list_chunks(&id).await.expect("list chunks");
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn rewriting_a_chunk_replaces_content() {
        let (_temp, store) = make_store();
        let id = UploadId::parse("upload-4").expect("id");
        store.store_chunk(&id, 0, b"first").await.expect("store chunk");
        store.store_chunk(&id, 0, b"second").await.expect("store chunk");

        let chunks = store.list_chunks(&id).await.expect("list chunks");
        assert_eq!(chunks.len(), 1);
        assert_eq!(std::fs::read(&chunks[0].1).expect("read"), b"second");
    }

    #[tokio::test]
    async fn scratch_guard_removes_dir_on_drop() {
        let (_temp, store) = make_store();
        let id = UploadId::parse("upload-5").expect("id");
        store.store_chunk(&id, 0, b"a").await.expect("store chunk");
        let dir = store.root_path().join("upload-5");

        drop(store.scratch(&id));
        wait_until_removed(&dir).await;
    }

    #[tokio::test]
    async fn released_scratch_is_gone_before_release_returns() {
        let (_temp, store) = make_store();
        let id = UploadId::parse("upload-7").expect("id");
        store.store_chunk(&id, 0, b"a").await.expect("store chunk");
        let dir = store.root_path().join("upload-7");

        store.scratch(&id).release().await;
        assert!(!dir.exists());

        // 释放后的守卫不会再删除同名的新分片
        store.store_chunk(&id, 0, b"b").await.expect("store chunk");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dir.join("0").exists());
    }

    #[tokio::test]
    async fn sweep_stale_honours_ttl() {
        let (_temp, store) = make_store();
        let id = UploadId::parse("upload-6").expect("id");
        store.store_chunk(&id, 0, b"a").await.expect("store chunk");

        let kept = store
            .sweep_stale(Duration::from_secs(3600))
            .await
            .expect("sweep");
        assert_eq!(kept, 0);
        assert!(fs::metadata(store.root_path().join("upload-6")).await.is_ok());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = store
            .sweep_stale(Duration::from_millis(1))
            .await
            .expect("sweep");
        assert_eq!(removed, 1);
        assert!(fs::metadata(store.root_path().join("upload-6")).await.is_err());
    }
}
