//! Cloud environment: the object-store backend the engine talks to
//!
//! Wraps `object_store` behind a blocking API. A private tokio runtime
//! drives the async calls; every call is bounded by the retry policy's
//! per-attempt timeout and retried with backoff.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tokio::runtime::Runtime;
use tracing::debug;

use crate::error::{CirrusError, Result};

use super::retry::with_retry;
use super::{BucketOptions, CloudBackend, CloudOptions, RetryPolicy};

/// Which configured bucket an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Src,
    Dest,
}

/// One bucket: the store holding it plus the key prefix inside the store
struct BucketStore {
    store: Arc<dyn ObjectStore>,
    /// Key prefix inside `store` (bucket name for shared stores)
    root: String,
    options: BucketOptions,
}

impl BucketStore {
    fn key(&self, name: &str) -> ObjectPath {
        let key = self.options.object_key(name);
        if self.root.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.root, key))
        }
    }

    fn dir(&self) -> ObjectPath {
        self.key("")
    }
}

/// Blocking facade over the configured object store buckets
pub struct CloudEnv {
    runtime: Runtime,
    src: Option<BucketStore>,
    dest: Option<BucketStore>,
    retry: RetryPolicy,
}

impl CloudEnv {
    /// Build the environment from options
    ///
    /// Fails with `Config` when no bucket is configured, when S3 is asked
    /// for without the `aws` feature, or when credentials are empty.
    pub fn new(options: &CloudOptions) -> Result<Self> {
        if options.src_bucket.is_none() && options.dest_bucket.is_none() {
            return Err(CirrusError::Config(
                "cloud options need a source or destination bucket".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cirrus-cloud")
            .enable_all()
            .build()?;

        let src = match &options.src_bucket {
            Some(bucket) => Some(Self::open_bucket(&options.backend, bucket)?),
            None => None,
        };
        let dest = match &options.dest_bucket {
            Some(bucket) => Some(Self::open_bucket(&options.backend, bucket)?),
            None => None,
        };

        Ok(Self {
            runtime,
            src,
            dest,
            retry: options.retry,
        })
    }

    fn open_bucket(backend: &CloudBackend, bucket: &BucketOptions) -> Result<BucketStore> {
        let (store, root): (Arc<dyn ObjectStore>, String) = match backend {
            CloudBackend::LocalFileSystem { root } => {
                let dir = root.join(bucket.bucket_name());
                fs::create_dir_all(&dir)?;
                let store: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new_with_prefix(&dir)?);
                (store, String::new())
            }
            CloudBackend::S3 {
                endpoint,
                region,
                credentials,
                allow_http,
            } => {
                if !credentials.has_valid() {
                    return Err(CirrusError::Config(
                        "S3 backend needs an access key id and secret".to_string(),
                    ));
                }
                (
                    Self::build_s3(bucket, endpoint.as_deref(), region, credentials, *allow_http)?,
                    String::new(),
                )
            }
            CloudBackend::Custom(store) => (Arc::clone(store), bucket.bucket_name()),
        };

        Ok(BucketStore {
            store,
            root,
            options: bucket.clone(),
        })
    }

    #[cfg(feature = "aws")]
    fn build_s3(
        bucket: &BucketOptions,
        endpoint: Option<&str>,
        region: &str,
        credentials: &super::Credentials,
        allow_http: bool,
    ) -> Result<Arc<dyn ObjectStore>> {
        let mut builder = object_store::aws::AmazonS3Builder::new()
            .with_bucket_name(bucket.bucket_name())
            .with_region(region)
            .with_access_key_id(&credentials.access_key_id)
            .with_secret_access_key(&credentials.secret_access_key)
            .with_allow_http(allow_http);
        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);
        Ok(store)
    }

    #[cfg(not(feature = "aws"))]
    fn build_s3(
        _bucket: &BucketOptions,
        _endpoint: Option<&str>,
        _region: &str,
        _credentials: &super::Credentials,
        _allow_http: bool,
    ) -> Result<Arc<dyn ObjectStore>> {
        Err(CirrusError::Config(
            "S3 backend requires the `aws` feature".to_string(),
        ))
    }

    pub fn has_src(&self) -> bool {
        self.src.is_some()
    }

    pub fn has_dest(&self) -> bool {
        self.dest.is_some()
    }

    fn bucket(&self, which: Bucket) -> Result<&BucketStore> {
        let bucket = match which {
            Bucket::Src => self.src.as_ref(),
            Bucket::Dest => self.dest.as_ref(),
        };
        bucket.ok_or_else(|| CirrusError::Config(format!("no {:?} bucket configured", which)))
    }

    /// Run one remote call under the per-attempt timeout, with retries
    fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = object_store::Result<T>>,
    {
        let timeout = self.retry.operation_timeout;
        with_retry(&self.retry, what, || {
            self.runtime.block_on(async {
                match tokio::time::timeout(timeout, call()).await {
                    Ok(result) => result.map_err(CirrusError::from),
                    Err(_) => Err(CirrusError::CloudTransport(format!(
                        "{} timed out after {:?}",
                        what, timeout
                    ))),
                }
            })
        })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Upload a local file to the destination bucket under `name`
    pub fn upload_file(&self, local: &Path, name: &str) -> Result<()> {
        let bucket = self.bucket(Bucket::Dest)?;
        let data = Bytes::from(fs::read(local)?);
        let key = bucket.key(name);
        let len = data.len();

        self.run("upload", || {
            let store = Arc::clone(&bucket.store);
            let key = key.clone();
            let payload = PutPayload::from(data.clone());
            async move { store.put(&key, payload).await }
        })?;

        debug!(object = %key, bytes = len, "Uploaded file");
        Ok(())
    }

    /// Download `name` from a bucket into `local`
    ///
    /// Each call writes its own `<name>.<random>.download` file next to
    /// `local` and renames it into place. Concurrent downloads of one object
    /// never share a temporary file.
    pub fn download_file(&self, which: Bucket, name: &str, local: &Path) -> Result<()> {
        let data = self
            .get_object(which, name)?
            .ok_or_else(|| CirrusError::ObjectNotFound(name.to_string()))?;

        let dir = local
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(name);
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{}.", file_name))
            .suffix(".download")
            .tempfile_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(local).map_err(|e| e.error)?;

        debug!(object = name, bytes = data.len(), path = %local.display(), "Downloaded file");
        Ok(())
    }

    /// Names of the objects under the bucket's object path
    pub fn list_objects(&self, which: Bucket) -> Result<Vec<String>> {
        let bucket = self.bucket(which)?;
        let dir = bucket.dir();
        let prefix = format!("{}/", dir.as_ref());

        let metas = self.run("list", || {
            let store = Arc::clone(&bucket.store);
            let dir = dir.clone();
            async move {
                let prefix = if dir.as_ref().is_empty() { None } else { Some(&dir) };
                store.list(prefix).try_collect::<Vec<_>>().await
            }
        })?;

        let mut names: Vec<String> = metas
            .into_iter()
            .map(|meta| {
                let location = meta.location.as_ref();
                location
                    .strip_prefix(&prefix)
                    .unwrap_or(location)
                    .to_string()
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Write an object to the destination bucket
    pub fn put_object(&self, name: &str, data: Bytes) -> Result<()> {
        let bucket = self.bucket(Bucket::Dest)?;
        let key = bucket.key(name);

        self.run("put", || {
            let store = Arc::clone(&bucket.store);
            let key = key.clone();
            let payload = PutPayload::from(data.clone());
            async move { store.put(&key, payload).await }
        })?;
        Ok(())
    }

    /// Read an object; `Ok(None)` when it does not exist
    pub fn get_object(&self, which: Bucket, name: &str) -> Result<Option<Bytes>> {
        let bucket = self.bucket(which)?;
        let key = bucket.key(name);

        let result = self.run("get", || {
            let store = Arc::clone(&bucket.store);
            let key = key.clone();
            async move { store.get(&key).await?.bytes().await }
        });

        match result {
            Ok(data) => Ok(Some(data)),
            Err(CirrusError::ObjectNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete an object from the destination bucket; missing objects are fine
    pub fn delete_object(&self, name: &str) -> Result<()> {
        let bucket = self.bucket(Bucket::Dest)?;
        let key = bucket.key(name);

        let result = self.run("delete", || {
            let store = Arc::clone(&bucket.store);
            let key = key.clone();
            async move { store.delete(&key).await }
        });

        match result {
            Ok(()) | Err(CirrusError::ObjectNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
