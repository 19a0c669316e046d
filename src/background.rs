//! 会话清理后台任务。

use std::time::Duration;
use tracing::debug;

use crate::config::SESSION_PRUNE_INTERVAL_SECS;
use crate::session::SharedSessions;

/// 定期清除过期会话。
pub fn spawn_background_tasks(sessions: SharedSessions) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let removed = sessions.prune_expired();
            if removed > 0 {
                debug!(removed, "pruned expired sessions");
            }
        }
    });
}
