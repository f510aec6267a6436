//! Cold start from the cloud mirror
//!
//! When the local directory has no manifest, the destination bucket is
//! tried first, then the source bucket. The manifest is written locally
//! only after the tables it needs are in place, so an interrupted bootstrap
//! simply starts over on the next open.

use tracing::info;

use crate::error::Result;
use crate::manifest::{ManifestState, MANIFEST_FILE_NAME};
use crate::storage::StorageManager;

use super::{Bucket, CloudEnv};

/// A manifest recovered from the cloud
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub state: ManifestState,
    /// Bucket the manifest came from
    pub bucket: Bucket,
}

/// Fetch the newest remote manifest; `None` when neither bucket has one
pub fn fetch_manifest(env: &CloudEnv) -> Result<Option<Bootstrap>> {
    let mut buckets = Vec::new();
    if env.has_dest() {
        buckets.push(Bucket::Dest);
    }
    if env.has_src() {
        buckets.push(Bucket::Src);
    }

    for bucket in buckets {
        if let Some(bytes) = env.get_object(bucket, MANIFEST_FILE_NAME)? {
            let state = ManifestState::decode(&bytes)?;
            return Ok(Some(Bootstrap { state, bucket }));
        }
    }
    Ok(None)
}

/// Bring the tables of a fetched manifest local (all of them with `eager`)
pub fn install_tables(storage: &StorageManager, found: &Bootstrap, eager: bool) -> Result<()> {
    let live = found.state.live_file_numbers();
    if eager {
        for number in &live {
            storage.fetch_table(*number)?;
        }
    }

    info!(
        bucket = ?found.bucket,
        families = found.state.column_families.len(),
        tables = live.len(),
        eager,
        last_sequence = found.state.last_sequence,
        "Bootstrapped from cloud manifest"
    );
    Ok(())
}
