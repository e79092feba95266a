//! 过期会话与废弃分片目录的后台清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::chunks::ChunkStore;
use crate::config::{SCRATCH_CLEAN_INTERVAL_SECS, SESSION_PRUNE_INTERVAL_SECS};
use crate::sessions::SessionRegistry;

/// 启动后台任务；ttl 为 0 的任务不会启动。
pub fn spawn_background_tasks(
    chunks: ChunkStore,
    sessions: Arc<SessionRegistry>,
    session_ttl: Duration,
    scratch_ttl: Duration,
) {
    if !session_ttl.is_zero() {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let pruned = sessions.prune_stale(session_ttl).await;
                if pruned > 0 {
                    info!(pruned, "pruned stale upload sessions");
                }
            }
        });
    }

    if !scratch_ttl.is_zero() {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(SCRATCH_CLEAN_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if let Err(err) = chunks.sweep_stale(scratch_ttl).await {
                    warn!(error = %err, "scratch cleanup failed");
                }
            }
        });
    }
}
