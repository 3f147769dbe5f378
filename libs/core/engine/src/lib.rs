//! engine - the Redis-stream messaging patterns powering the teaching platform.
//!
//! Twelve cooperating components built on a small shared foundation:
//! - **C1** [`scripts`] installs the broker-side Lua procedures.
//! - **C2** [`tailer`] observes raw stream appends and republishes them as events.
//! - **C3** [`broadcaster`] fans those events out to every connected observer.
//! - **C4** [`dlq`] claims-or-dead-letters pending entries atomically.
//! - **C5** / **C6** [`work_queue`] / [`fanout`] consume a stream competitively or independently.
//! - **C7** / **C12** [`topic`] route by pattern and hold the rule store CRUD.
//! - **C8** [`request_reply`] correlates a request with its response or its timeout.
//! - **C9** [`per_key`] serializes processing within a business key.
//! - **C10** [`token_bucket`] caps concurrency per job type.
//! - **C11** [`scheduler`] fires messages at a future time.
//!
//! [`config`], [`error`], [`event`], [`keys`], [`health`], and [`metrics`] are
//! the ambient stack every component is built on.

pub mod broadcaster;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod fanout;
pub mod health;
pub mod keys;
pub mod metrics;
pub mod per_key;
pub mod request_reply;
pub mod scheduler;
pub mod scripts;
pub mod tailer;
pub mod token_bucket;
pub mod topic;
pub mod work_queue;

pub use broadcaster::Broadcaster;
pub use config::{DlqConfig, EngineConfig};
pub use error::{EngineError, EngineResult, ErrorCategory, RetryStrategy};
pub use event::{EngineEvent, EventType};
pub use scripts::Scripts;
