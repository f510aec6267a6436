//! Write batches
//!
//! A `WriteBatch` collects mutations for one or more column families and is
//! applied atomically by `Db::write`: every operation becomes visible, or
//! none does.

use serde::{Deserialize, Serialize};

use crate::db::ColumnFamilyHandle;

/// Id of the default column family
pub const DEFAULT_COLUMN_FAMILY_ID: u32 = 0;

/// A single mutation, as logged in the WAL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Put a key-value pair
    Put {
        cf_id: u32,
        key: Vec<u8>,
        value: Vec<u8>,
    },

    /// Delete a key
    Delete { cf_id: u32, key: Vec<u8> },
}

impl Operation {
    pub fn cf_id(&self) -> u32 {
        match self {
            Operation::Put { cf_id, .. } | Operation::Delete { cf_id, .. } => *cf_id,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Put { key, .. } | Operation::Delete { key, .. } => key,
        }
    }
}

/// An ordered set of mutations applied atomically
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<Operation>,
    /// Db instances whose handles were used to build this batch
    instances: Vec<u64>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put into the default column family
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.ops.push(Operation::Put {
            cf_id: DEFAULT_COLUMN_FAMILY_ID,
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        });
    }

    /// Delete from the default column family
    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.ops.push(Operation::Delete {
            cf_id: DEFAULT_COLUMN_FAMILY_ID,
            key: key.as_ref().to_vec(),
        });
    }

    pub fn put_cf(
        &mut self,
        cf: &ColumnFamilyHandle,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) {
        self.note_instance(cf.instance_id());
        self.ops.push(Operation::Put {
            cf_id: cf.id(),
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        });
    }

    pub fn delete_cf(&mut self, cf: &ColumnFamilyHandle, key: impl AsRef<[u8]>) {
        self.note_instance(cf.instance_id());
        self.ops.push(Operation::Delete {
            cf_id: cf.id(),
            key: key.as_ref().to_vec(),
        });
    }

    /// Number of operations in the batch
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.instances.clear();
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    pub(crate) fn instances(&self) -> &[u64] {
        &self.instances
    }

    pub(crate) fn into_operations(self) -> Vec<Operation> {
        self.ops
    }

    fn note_instance(&mut self, instance: u64) {
        if !self.instances.contains(&instance) {
            self.instances.push(instance);
        }
    }
}
