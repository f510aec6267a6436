//! Cloud configuration surface

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use object_store::ObjectStore;

use super::LogShipper;

/// Default bucket prefix
pub const DEFAULT_BUCKET_PREFIX: &str = "cirrus.";

// =============================================================================
// Credentials
// =============================================================================

/// Access key pair for an S3-compatible endpoint
#[derive(Clone, Default)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// True when both halves are present
    pub fn has_valid(&self) -> bool {
        !self.access_key_id.trim().is_empty() && !self.secret_access_key.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Buckets
// =============================================================================

/// A bucket plus the object path inside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketOptions {
    /// Prepended to `suffix` to form the bucket name
    pub prefix: String,
    pub suffix: String,
    /// Directory inside the bucket holding this database's objects
    pub object_path: String,
}

impl BucketOptions {
    pub fn new(suffix: impl Into<String>, object_path: impl Into<String>) -> Self {
        Self {
            prefix: DEFAULT_BUCKET_PREFIX.to_string(),
            suffix: suffix.into(),
            object_path: object_path.into(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn bucket_name(&self) -> String {
        format!("{}{}", self.prefix, self.suffix)
    }

    /// Object key of `name` inside this bucket
    pub fn object_key(&self, name: &str) -> String {
        let dir = self.object_path.trim_matches('/');
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", dir, name)
        }
    }
}

// =============================================================================
// Backend / Transport / Retry
// =============================================================================

/// Where the buckets live
#[derive(Clone)]
pub enum CloudBackend {
    /// Buckets are directories under `root`
    LocalFileSystem { root: PathBuf },

    /// S3-compatible endpoint (requires the `aws` feature)
    S3 {
        endpoint: Option<String>,
        region: String,
        credentials: Credentials,
        allow_http: bool,
    },

    /// Any object store; bucket names become the first path segment
    Custom(Arc<dyn ObjectStore>),
}

impl fmt::Debug for CloudBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudBackend::LocalFileSystem { root } => f
                .debug_struct("LocalFileSystem")
                .field("root", root)
                .finish(),
            CloudBackend::S3 {
                endpoint,
                region,
                credentials,
                allow_http,
            } => f
                .debug_struct("S3")
                .field("endpoint", endpoint)
                .field("region", region)
                .field("credentials", credentials)
                .field("allow_http", allow_http)
                .finish(),
            CloudBackend::Custom(store) => f.debug_tuple("Custom").field(&store.to_string()).finish(),
        }
    }
}

/// Replication channel for logged batches
#[derive(Clone, Default)]
pub enum LogTransport {
    /// Local WAL only
    #[default]
    LocalWal,

    /// Also ship each batch as an object in the destination bucket
    ObjectStore,

    /// Also ship each batch through a caller-provided shipper
    Custom(Arc<dyn LogShipper>),
}

impl fmt::Debug for LogTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTransport::LocalWal => f.write_str("LocalWal"),
            LogTransport::ObjectStore => f.write_str("ObjectStore"),
            LogTransport::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Bounded exponential backoff for remote operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single attempt
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Cloud Options
// =============================================================================

/// Remote mirror configuration, set on `Options::cloud`
#[derive(Debug, Clone)]
pub struct CloudOptions {
    pub backend: CloudBackend,

    /// Bucket to bootstrap from when it differs from `dest_bucket`
    pub src_bucket: Option<BucketOptions>,

    /// Bucket the mirror writes to
    pub dest_bucket: Option<BucketOptions>,

    /// Archive obsolete WAL segments instead of deleting them
    pub keep_local_log_files: bool,

    /// Download every table on bootstrap instead of on first read
    pub keep_local_sst_files: bool,

    pub log_transport: LogTransport,

    pub retry: RetryPolicy,
}

impl CloudOptions {
    pub fn new(backend: CloudBackend) -> Self {
        Self {
            backend,
            src_bucket: None,
            dest_bucket: None,
            keep_local_log_files: false,
            keep_local_sst_files: true,
            log_transport: LogTransport::LocalWal,
            retry: RetryPolicy::default(),
        }
    }

    pub fn src_bucket(mut self, bucket: BucketOptions) -> Self {
        self.src_bucket = Some(bucket);
        self
    }

    pub fn dest_bucket(mut self, bucket: BucketOptions) -> Self {
        self.dest_bucket = Some(bucket);
        self
    }

    pub fn keep_local_log_files(mut self, keep: bool) -> Self {
        self.keep_local_log_files = keep;
        self
    }

    pub fn keep_local_sst_files(mut self, keep: bool) -> Self {
        self.keep_local_sst_files = keep;
        self
    }

    pub fn log_transport(mut self, transport: LogTransport) -> Self {
        self.log_transport = transport;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
