//! Cloud Module
//!
//! Mirrors local durable state to an object store and rebuilds a fresh
//! local instance from it.
//!
//! ## Components
//! ```text
//! ┌────────────┐  sync jobs   ┌─────────────┐  blocking calls  ┌───────────┐
//! │ Db (flush) │ ───────────► │ CloudMirror │ ───────────────► │ CloudEnv  │
//! └────────────┘              └─────────────┘                  │ (tokio +  │
//!       │ batches             ┌─────────────┐                  │  object_  │
//!       └───────────────────► │ LogShipper  │ ───────────────► │  store)   │
//!                             └─────────────┘                  └───────────┘
//! ```
//!
//! - `CloudEnv`: buckets, naming, timeouts and retries
//! - `CloudMirror`: uploads tables, then the manifest, then prunes
//! - `LogShipper`: optional remote replication of logged batches
//! - `PersistentCache`: bounded local home for tables fetched on cold reads
//! - `bootstrap`: rebuild a missing local manifest from the cloud

mod bootstrap;
mod cache;
mod env;
mod log_shipper;
mod mirror;
mod options;
mod retry;

pub use bootstrap::{fetch_manifest, install_tables, Bootstrap};
pub use cache::PersistentCache;
pub use env::{Bucket, CloudEnv};
pub use log_shipper::{LogShipper, LogShippingWorker, ObjectLogShipper, LOG_OBJECT_DIR};
pub use mirror::{CloudMirror, MirrorJob, SyncDone};
pub use options::{
    BucketOptions, CloudBackend, CloudOptions, Credentials, LogTransport, RetryPolicy,
    DEFAULT_BUCKET_PREFIX,
};
pub use retry::with_retry;
