//! User to thread id registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{OnceCell, OwnedMutexGuard};

use crate::agent::{AgentService, AgentServiceError};

/// Users tracked before idle mappings are evicted.
pub const DEFAULT_MAX_USERS: usize = 10_000;

/// One user's thread id plus the lock that keeps their turns sequential.
#[derive(Debug)]
struct UserThread {
    /// Empty until creation succeeds.
    thread_id: OnceCell<String>,
    turn: Arc<tokio::sync::Mutex<()>>,
    last_used: Mutex<Instant>,
}

impl UserThread {
    fn new() -> Self {
        Self {
            thread_id: OnceCell::new(),
            turn: Arc::new(tokio::sync::Mutex::new(())),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type ThreadSlot = Arc<UserThread>;

/// Exclusive use of a user's thread for one turn.
///
/// A hosted thread accepts no new message while a run is active, so a second
/// turn of the same user waits until this lease is dropped.
#[derive(Debug)]
pub struct TurnLease {
    pub thread_id: String,
    _turn: OwnedMutexGuard<()>,
}

/// Thread-safe map from user identity to hosted thread id.
///
/// Thread creation is single-flight per user: concurrent first messages wait
/// on the same slot, so exactly one thread is created and both turns see it.
/// A failed creation drops the slot and the next call retries. Past
/// `max_users` entries the least recently used idle mapping is forgotten,
/// exactly as if that user had reset.
#[derive(Clone)]
pub struct ThreadRegistry {
    service: Arc<dyn AgentService>,
    threads: Arc<Mutex<HashMap<String, ThreadSlot>>>,
    max_users: usize,
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("users", &self.len())
            .field("max_users", &self.max_users)
            .finish_non_exhaustive()
    }
}

impl ThreadRegistry {
    pub fn new(service: Arc<dyn AgentService>) -> Self {
        Self {
            service,
            threads: Arc::new(Mutex::new(HashMap::new())),
            max_users: DEFAULT_MAX_USERS,
        }
    }

    #[must_use]
    pub fn with_max_users(mut self, max_users: usize) -> Self {
        self.max_users = max_users.max(1);
        self
    }

    fn slot(&self, user_id: &str) -> ThreadSlot {
        let mut map = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = map.get(user_id) {
            slot.touch();
            return Arc::clone(slot);
        }
        if map.len() >= self.max_users {
            evict_idle(&mut map);
        }
        let slot = Arc::new(UserThread::new());
        map.insert(user_id.to_string(), Arc::clone(&slot));
        slot
    }

    async fn resolve(&self, user_id: &str, slot: &ThreadSlot) -> Result<String, AgentServiceError> {
        let result = slot
            .thread_id
            .get_or_try_init(|| async {
                let thread_id = self.service.create_thread().await?;
                tracing::info!(user_id = %user_id, thread_id = %thread_id, "Created thread");
                Ok::<_, AgentServiceError>(thread_id)
            })
            .await
            .cloned();
        if result.is_err() {
            self.discard_failed(user_id, slot);
        }
        result
    }

    /// Drop an empty slot nobody else is waiting on.
    fn discard_failed(&self, user_id: &str, slot: &ThreadSlot) {
        let mut map = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry plus the caller's handle; other waiters retry through the slot.
        let unused = map.get(user_id).is_some_and(|current| {
            Arc::ptr_eq(current, slot)
                && Arc::strong_count(slot) == 2
                && slot.thread_id.get().is_none()
        });
        if unused {
            map.remove(user_id);
        }
    }

    /// The user's thread id, creating the thread on first contact.
    ///
    /// A cache hit makes no network call.
    pub async fn get_or_create_thread(&self, user_id: &str) -> Result<String, AgentServiceError> {
        let slot = self.slot(user_id);
        self.resolve(user_id, &slot).await
    }

    /// Wait for the user's previous turn, then resolve their thread.
    pub async fn begin_turn(&self, user_id: &str) -> Result<TurnLease, AgentServiceError> {
        let slot = self.slot(user_id);
        let turn = Arc::clone(&slot.turn).lock_owned().await;
        let thread_id = self.resolve(user_id, &slot).await?;
        Ok(TurnLease {
            thread_id,
            _turn: turn,
        })
    }

    /// Forget the user's thread. The next message provisions a new one.
    ///
    /// Returns the dropped thread id, if one had been created.
    pub fn reset_thread(&self, user_id: &str) -> Option<String> {
        let removed = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
        let previous = removed.and_then(|slot| slot.thread_id.get().cloned());
        tracing::info!(user_id = %user_id, previous_thread = ?previous, "Thread reset");
        previous
    }

    /// The user's current thread id without creating one.
    pub fn current_thread(&self, user_id: &str) -> Option<String> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .and_then(|slot| slot.thread_id.get().cloned())
    }

    /// Number of users with a slot.
    pub fn len(&self) -> usize {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remove the least recently used slot that no turn is holding.
fn evict_idle(map: &mut HashMap<String, ThreadSlot>) {
    let oldest = map
        .iter()
        .filter(|(_, slot)| Arc::strong_count(slot) == 1)
        .min_by_key(|(_, slot)| slot.last_used())
        .map(|(user_id, _)| user_id.clone());
    if let Some(user_id) = oldest {
        map.remove(&user_id);
        tracing::info!(user_id = %user_id, "Evicted idle thread mapping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{
        Agent, AgentDefinition, MessageRole, Run, ThreadMessage, ToolOutput,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts thread creations; everything else is unused here.
    #[derive(Debug, Default)]
    struct CountingService {
        created: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl AgentService for CountingService {
        async fn create_thread(&self) -> Result<String, AgentServiceError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && n == 0 {
                return Err(AgentServiceError::Status {
                    status: 503,
                    body: "busy".into(),
                });
            }
            Ok(format!("thread_{n}"))
        }

        async fn create_message(
            &self,
            _: &str,
            _: MessageRole,
            _: &str,
        ) -> Result<ThreadMessage, AgentServiceError> {
            unimplemented!()
        }

        async fn create_run(
            &self,
            _: &str,
            _: &str,
            _: &[serde_json::Value],
        ) -> Result<Run, AgentServiceError> {
            unimplemented!()
        }

        async fn get_run(&self, _: &str, _: &str) -> Result<Run, AgentServiceError> {
            unimplemented!()
        }

        async fn submit_tool_outputs(
            &self,
            _: &str,
            _: &str,
            _: &[ToolOutput],
        ) -> Result<Run, AgentServiceError> {
            unimplemented!()
        }

        async fn cancel_run(&self, _: &str, _: &str) -> Result<Run, AgentServiceError> {
            unimplemented!()
        }

        async fn list_messages(
            &self,
            _: &str,
            _: Option<&str>,
        ) -> Result<Vec<ThreadMessage>, AgentServiceError> {
            unimplemented!()
        }

        async fn create_agent(&self, _: &AgentDefinition) -> Result<Agent, AgentServiceError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_thread_is_reused_until_reset() {
        let service = Arc::new(CountingService::default());
        let threads = ThreadRegistry::new(Arc::clone(&service) as Arc<dyn AgentService>);

        let first = threads.get_or_create_thread("alice").await.unwrap();
        let again = threads.get_or_create_thread("alice").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(service.created.load(Ordering::SeqCst), 1);

        assert_eq!(threads.reset_thread("alice"), Some(first.clone()));
        assert_eq!(threads.current_thread("alice"), None);

        let fresh = threads.get_or_create_thread("alice").await.unwrap();
        assert_ne!(fresh, first);
        assert_eq!(service.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let threads = ThreadRegistry::new(Arc::new(CountingService::default()));
        let a = threads.get_or_create_thread("alice").await.unwrap();
        let b = threads.get_or_create_thread("bob").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(threads.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_messages_share_one_thread() {
        let service = Arc::new(CountingService::default());
        let threads = ThreadRegistry::new(Arc::clone(&service) as Arc<dyn AgentService>);

        let (a, b) = tokio::join!(
            threads.get_or_create_thread("carol"),
            threads.get_or_create_thread("carol")
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(service.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_is_retried() {
        let service = Arc::new(CountingService {
            fail_first: true,
            ..Default::default()
        });
        let threads = ThreadRegistry::new(Arc::clone(&service) as Arc<dyn AgentService>);

        assert!(threads.get_or_create_thread("dave").await.is_err());
        assert_eq!(threads.current_thread("dave"), None);
        assert!(threads.is_empty());
        assert_eq!(threads.get_or_create_thread("dave").await.unwrap(), "thread_1");
    }

    #[tokio::test]
    async fn test_idle_users_evicted_past_limit() {
        let threads = ThreadRegistry::new(Arc::new(CountingService::default())).with_max_users(2);

        let alice = threads.get_or_create_thread("alice").await.unwrap();
        threads.get_or_create_thread("bob").await.unwrap();
        // Touch alice so bob is the least recently used.
        assert_eq!(threads.get_or_create_thread("alice").await.unwrap(), alice);
        threads.get_or_create_thread("carol").await.unwrap();

        assert_eq!(threads.len(), 2);
        assert_eq!(threads.current_thread("alice"), Some(alice));
        assert_eq!(threads.current_thread("bob"), None);
    }

    #[tokio::test]
    async fn test_turns_of_one_user_are_sequential() {
        let threads = ThreadRegistry::new(Arc::new(CountingService::default()));

        let first = threads.begin_turn("erin").await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), threads.begin_turn("erin")).await;
        assert!(waiting.is_err(), "second turn must wait for the first");

        let thread_id = first.thread_id.clone();
        drop(first);
        let second = threads.begin_turn("erin").await.unwrap();
        assert_eq!(second.thread_id, thread_id);

        // Other users are not blocked.
        assert!(threads.begin_turn("frank").await.is_ok());
    }

    #[test]
    fn test_reset_unknown_user_is_noop() {
        let threads = ThreadRegistry::new(Arc::new(CountingService::default()));
        assert_eq!(threads.reset_thread("nobody"), None);
        assert!(threads.is_empty());
    }
}
