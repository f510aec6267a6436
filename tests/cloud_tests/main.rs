//! Cloud test suite
//!
//! Buckets live on the local filesystem (or in memory) so the suite runs
//! without network access.


use std::path::Path;
use std::time::Duration;

use cirruskv::cloud::{BucketOptions, CloudBackend, CloudOptions, RetryPolicy};

/// Cloud options with buckets under `root`
pub fn local_options(
    root: &Path,
    src: Option<&str>,
    dest: Option<&str>,
) -> CloudOptions {
    let mut options = CloudOptions::new(CloudBackend::LocalFileSystem {
        root: root.to_path_buf(),
    })
    .retry(fast_retry());
    if let Some(suffix) = src {
        options = options.src_bucket(BucketOptions::new(suffix, "db"));
    }
    if let Some(suffix) = dest {
        options = options.dest_bucket(BucketOptions::new(suffix, "db"));
    }
    options
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        operation_timeout: Duration::from_secs(10),
    }
}
