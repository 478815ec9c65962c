//! Per-user conversation thread bookkeeping.
//!
//! Each user identity maps to at most one hosted thread id for the lifetime of
//! the process. The first message creates the thread; a reset drops the
//! mapping so the next message starts a fresh one. Nothing is persisted and
//! abandoned threads are left on the hosted service.
//!
//! # Example
//!
//! ```rust,ignore
//! use clinical_assistant::session::ThreadRegistry;
//!
//! let threads = ThreadRegistry::new(service);
//! let thread_id = threads.get_or_create_thread("user-1").await?;
//! assert_eq!(threads.get_or_create_thread("user-1").await?, thread_id);
//! ```

mod thread;

pub use thread::{DEFAULT_MAX_USERS, ThreadRegistry, TurnLease};
