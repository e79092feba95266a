//! 多文件提交的会话登记与完成计数。

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 提交者信息，随会话一同登记。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submitter {
    pub email: String,
    pub phone: String,
    pub data_origin: String,
}

impl Submitter {
    fn same_contact(&self, other: &Submitter) -> bool {
        self.email.trim() == other.email.trim() && self.phone.trim() == other.phone.trim()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub started_at: DateTime<Utc>,
    pub submitter: Submitter,
}

/// 登记后只读的会话属性；完成计数单独加锁。
#[derive(Debug)]
struct UploadSession {
    submitter: Submitter,
    expected: u32,
    started_at: DateTime<Utc>,
    registered: Instant,
    completed: Mutex<u32>,
}

/// 会话表：外层锁只保护映射结构，计数在每个会话自己的锁内完成。
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<UploadSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 登记会话，同名会话直接覆盖。`expected` 小于 1 时按 1 处理。
    ///
    /// 同一联系人的在册会话各自占用不同的秒级时间戳，保证目录不重叠。
    pub async fn register(&self, session_id: &str, expected: i64, submitter: Submitter) {
        let expected = u32::try_from(expected.max(1)).unwrap_or(u32::MAX);
        let mut sessions = self.sessions.lock().await;

        let mut started_at = Utc::now();
        while sessions.iter().any(|(id, other)| {
            id != session_id
                && other.started_at.timestamp() == started_at.timestamp()
                && other.submitter.same_contact(&submitter)
        }) {
            started_at += TimeDelta::seconds(1);
        }

        let session = UploadSession {
            submitter,
            expected,
            started_at,
            registered: Instant::now(),
            completed: Mutex::new(0),
        };
        let previous = sessions.insert(session_id.to_string(), Arc::new(session));
        if previous.is_some() {
            warn!(session_id, "session re-registered, previous progress discarded");
        }
        info!(session_id, expected, "registered upload session");
    }

    /// 记录一个文件完成；返回是否应由本次调用写入说明文件。
    ///
    /// 只有使计数恰好达到预期值的那次调用返回 `true`，并同时移除会话。
    /// 未知会话返回 `true`。
    pub async fn record_completion(&self, session_id: &str) -> bool {
        let Some(session) = self.lookup(session_id).await else {
            warn!(session_id, "session not found, treating as single file upload");
            return true;
        };

        let mut completed = session.completed.lock().await;
        *completed = completed.saturating_add(1);
        info!(
            session_id,
            completed = *completed,
            expected = session.expected,
            "session progress"
        );
        if *completed != session.expected {
            return false;
        }

        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            sessions.remove(session_id);
        }
        info!(session_id, "all files completed for session");
        true
    }

    /// 会话登记时间与提交者信息，用于让同一会话的文件落在同一目录。
    pub async fn info(&self, session_id: &str) -> Option<SessionInfo> {
        let session = self.lookup(session_id).await?;
        Some(SessionInfo {
            started_at: session.started_at,
            submitter: session.submitter.clone(),
        })
    }

    #[cfg(test)]
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// 丢弃登记超过 ttl 仍未完成的会话。
    pub async fn prune_stale(&self, ttl: Duration) -> usize {
        if ttl.is_zero() {
            return 0;
        }
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|session_id, session| {
            let keep = now.duration_since(session.registered) < ttl;
            if !keep {
                warn!(
                    session_id = session_id.as_str(),
                    expected = session.expected,
                    "dropping stale session"
                );
            }
            keep
        });
        before - sessions.len()
    }

    async fn lookup(&self, session_id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.lock().await.get(session_id).cloned()
    }
}
