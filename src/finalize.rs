//! 上传编排：校验、合并分片、上传远端、按会话决定是否写说明文件。

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future;
use futures_util::stream;
use std::fmt::Write as _;
use std::io;
use std::sync::Arc;
use tracing::info;

use crate::assemble::assemble;
use crate::chunks::{ChunkStore, Scratch, UploadId, sanitize_segment};
use crate::error::{ApiError, remote_failure};
use crate::remote::{ByteStream, RemoteStorage};
use crate::sessions::{SessionRegistry, Submitter};

/// 一次 finalize 调用的输入。
#[derive(Debug, Clone, Default)]
pub struct FinalizeRequest {
    pub upload_id: String,
    pub file_name: String,
    pub submitter: Submitter,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub folder: String,
    pub file_name: String,
    pub note_written: bool,
}

/// 组合根：持有分片暂存区、远端存储与会话表。
pub struct Uploader {
    chunks: ChunkStore,
    remote: Arc<dyn RemoteStorage>,
    sessions: Arc<SessionRegistry>,
    note_name: String,
}

impl Uploader {
    pub fn new(
        chunks: ChunkStore,
        remote: Arc<dyn RemoteStorage>,
        sessions: Arc<SessionRegistry>,
        note_name: String,
    ) -> Self {
        Self {
            chunks,
            remote,
            sessions,
            note_name,
        }
    }

    #[cfg(test)]
    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    /// 登记多文件会话。
    pub async fn open_session(&self, session_id: &str, total_files: i64, submitter: Submitter) {
        self.sessions
            .register(session_id, total_files, submitter)
            .await;
    }

    /// 保存单个分片。
    pub async fn store_chunk(
        &self,
        raw_upload_id: &str,
        index: u64,
        content: &[u8],
    ) -> Result<(), ApiError> {
        let upload_id = UploadId::parse(raw_upload_id)?;
        self.chunks.store_chunk(&upload_id, index, content).await?;
        Ok(())
    }

    /// 合并分片并上传；任何一步失败都会中止后续步骤。
    ///
    /// 上传标识校验通过后，暂存区在返回前一定已被删除。
    pub async fn finalize(&self, request: FinalizeRequest) -> Result<Finalized, ApiError> {
        let upload_id = UploadId::parse(&request.upload_id)?;
        let scratch = self.chunks.scratch(&upload_id);
        let result = self.relay(&scratch, request).await;
        scratch.release().await;
        result
    }

    async fn relay(&self, scratch: &Scratch, request: FinalizeRequest) -> Result<Finalized, ApiError> {
        let upload_id = scratch.upload_id();
        let file_name = sanitize_segment(&request.file_name)
            .ok_or_else(|| ApiError::BadRequest("Invalid file name.".into()))?;

        let session_id = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let session = match session_id {
            Some(id) => self.sessions.info(id).await,
            None => None,
        };
        let (stamp, submitter) = match session {
            Some(info) => (info.started_at, merge_submitter(request.submitter, info.submitter)),
            None => (Utc::now(), request.submitter),
        };
        let folder = folder_name(stamp, &submitter.email, &submitter.phone)
            .ok_or_else(|| ApiError::BadRequest("Invalid folder name.".into()))?;

        self.remote
            .ensure_folder(&folder)
            .await
            .map_err(|err| remote_failure("Failed to create folder in remote storage.", err))?;

        let assembly = assemble(&self.chunks, scratch).await?;
        let total_bytes = assembly.total_bytes;
        let chunk_count = assembly.chunk_count;
        self.remote
            .put_file(&folder, &file_name, assembly.into_stream(), Some(total_bytes))
            .await
            .map_err(|err| remote_failure("Failed to upload to remote storage.", err))?;
        info!(
            upload_id = upload_id.as_str(),
            folder,
            file_name,
            chunk_count,
            total_bytes,
            "file uploaded"
        );

        let write_note = match session_id {
            Some(id) => self.sessions.record_completion(id).await,
            None => true,
        };
        let mut note_written = false;
        if !write_note {
            info!(
                session_id = session_id.unwrap_or_default(),
                "skipped description upload, session still has pending files"
            );
        } else if self.remote.file_exists(&folder, &self.note_name).await {
            info!(folder, "description already exists, skipping upload");
        } else {
            let note = render_note(Utc::now(), request.file_name.trim(), &submitter);
            let length = note.len() as u64;
            self.remote
                .put_file(&folder, &self.note_name, text_stream(note), Some(length))
                .await
                .map_err(|err| remote_failure("Failed to upload description file.", err))?;
            info!(folder, "uploaded description file");
            note_written = true;
        }

        Ok(Finalized {
            folder,
            file_name,
            note_written,
        })
    }
}

/// 请求中为空的字段回退到会话登记时的值。
fn merge_submitter(request: Submitter, registered: Submitter) -> Submitter {
    let pick = |own: String, fallback: String| if own.trim().is_empty() { fallback } else { own };
    Submitter {
        email: pick(request.email, registered.email),
        phone: pick(request.phone, registered.phone),
        data_origin: pick(request.data_origin, registered.data_origin),
    }
}

/// 由时间戳、邮箱与电话生成目录名。
pub fn folder_name(stamp: DateTime<Utc>, email: &str, phone: &str) -> Option<String> {
    let mut components = vec![stamp.timestamp().to_string()];

    let email = email.trim();
    if !email.is_empty() {
        components.push(
            email
                .replace('@', "_at_")
                .replace(['.', '/', '\\'], "_"),
        );
    }

    let phone = phone.trim();
    if !phone.is_empty() {
        components.push(
            phone
                .replace([' ', '-', '(', ')'], "")
                .replace('+', "plus")
                .replace(['/', '\\'], "_"),
        );
    }

    let folder = components.join("-");
    sanitize_segment(&folder).filter(|safe| *safe == folder)
}

/// 生成说明文件内容。
pub fn render_note(now: DateTime<Utc>, file_name: &str, submitter: &Submitter) -> String {
    let mut note = String::from("--- UPLOAD INFORMATION ---\n");
    let _ = writeln!(
        note,
        "Timestamp (UTC): {}",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let _ = writeln!(note, "Original Filename: {file_name}");
    let _ = writeln!(note, "Email: {}", submitter.email);
    if !submitter.phone.is_empty() {
        let _ = writeln!(note, "Teléfono: {}", submitter.phone);
    }
    note.push_str("\n--- DESCRIPCIÓN ---\n");
    note.push_str(&submitter.data_origin);
    note.push_str("\n\n--- FIN ---\n");
    note
}

fn text_stream(text: String) -> ByteStream {
    Box::pin(stream::once(future::ready(Ok::<_, io::Error>(Bytes::from(text)))))
}
