//! 会话存储：令牌到用户名的映射，按不活跃时间过期。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// 时间来源，测试中可替换为手动时钟。
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Session lookup and lifecycle used by the handlers.
///
/// Implementations must be safe to share between connection tasks.
pub trait SessionStore: Send + Sync {
    /// 为用户创建会话并返回新令牌。
    fn create(&self, username: &str) -> String;
    /// 查找会话；命中时刷新活跃时间。
    fn lookup(&self, token: &str) -> Option<String>;
    fn remove(&self, token: &str);
    /// 清理过期会话，返回清理数量。
    fn prune_expired(&self) -> usize;
    fn ttl(&self) -> Duration;
}

pub type SharedSessions = Arc<dyn SessionStore>;

#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub last_seen: Instant,
}

/// 基于互斥锁保护的 HashMap 的内存会话存储。
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, session: &Session, now: Instant) -> bool {
        now.saturating_duration_since(session.last_seen) >= self.ttl
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self, username: &str) -> String {
        let now = self.clock.now();
        let token = Uuid::new_v4().to_string();
        let mut sessions = self.sessions();
        sessions.retain(|_, session| !self.is_expired(session, now));
        sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                last_seen: now,
            },
        );
        token
    }

    fn lookup(&self, token: &str) -> Option<String> {
        let now = self.clock.now();
        let mut sessions = self.sessions();
        let session = sessions.get_mut(token)?;
        if self.is_expired(session, now) {
            sessions.remove(token);
            return None;
        }
        session.last_seen = now;
        Some(session.username.clone())
    }

    fn remove(&self, token: &str) {
        self.sessions().remove(token);
    }

    fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, session| !self.is_expired(session, now));
        before - sessions.len()
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 手动推进的时钟。
    pub(crate) struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut offset = self.offset.lock().unwrap();
            *offset += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    fn store_with_clock(ttl_secs: u64) -> (Arc<ManualClock>, MemorySessionStore) {
        let clock = Arc::new(ManualClock::new());
        let store = MemorySessionStore::with_clock(Duration::from_secs(ttl_secs), clock.clone());
        (clock, store)
    }

    #[test]
    fn created_session_resolves_immediately() {
        let (_clock, store) = store_with_clock(1800);
        let token = store.create("alice");
        assert_eq!(store.lookup(&token).as_deref(), Some("alice"));
        assert_eq!(store.lookup("unknown"), None);
    }

    #[test]
    fn tokens_are_unique() {
        let (_clock, store) = store_with_clock(1800);
        let first = store.create("alice");
        let second = store.create("alice");
        assert_ne!(first, second);
        assert_eq!(first.len(), 36);
    }

    #[test]
    fn lookup_refreshes_inactivity_window() {
        let (clock, store) = store_with_clock(1800);
        let token = store.create("alice");

        clock.advance(Duration::from_secs(1500));
        assert!(store.lookup(&token).is_some());

        clock.advance(Duration::from_secs(1500));
        assert_eq!(store.lookup(&token).as_deref(), Some("alice"));
    }

    #[test]
    fn session_expires_after_inactivity() {
        let (clock, store) = store_with_clock(1800);
        let token = store.create("alice");

        clock.advance(Duration::from_secs(1800));
        assert_eq!(store.lookup(&token), None);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.lookup(&token), None);
    }

    #[test]
    fn remove_invalidates_token() {
        let (_clock, store) = store_with_clock(1800);
        let token = store.create("bob");
        store.remove(&token);
        assert_eq!(store.lookup(&token), None);
    }

    #[test]
    fn prune_and_create_sweep_expired_entries() {
        let (clock, store) = store_with_clock(60);
        store.create("a");
        store.create("b");
        clock.advance(Duration::from_secs(30));
        let fresh = store.create("c");
        clock.advance(Duration::from_secs(45));

        assert_eq!(store.prune_expired(), 2);
        assert_eq!(store.prune_expired(), 0);
        assert_eq!(store.lookup(&fresh).as_deref(), Some("c"));

        clock.advance(Duration::from_secs(61));
        store.create("d");
        assert_eq!(store.sessions().len(), 1);
    }
}
