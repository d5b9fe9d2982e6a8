use std::sync::{Arc, RwLock};

use tracing::{instrument, warn};

use super::{Error, Store};
use crate::store_path::StorePath;

/// Records every batch it is asked to build. Paths added with
/// [MemoryStore::fail_on] make the batch containing them fail.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    builds: Arc<RwLock<Vec<Vec<StorePath>>>>,
    failing: Arc<RwLock<Vec<StorePath>>>,
}

impl MemoryStore {
    pub fn fail_on(&self, path: StorePath) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(path);
    }

    /// All batches built so far, in order.
    pub fn builds(&self) -> Vec<Vec<StorePath>> {
        self.builds
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Store for MemoryStore {
    #[instrument(skip(self), fields(paths = paths.len()), err)]
    fn build(&self, paths: &[StorePath]) -> Result<(), Error> {
        self.builds
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(paths.to_vec());

        let failing = self.failing.read().unwrap_or_else(|e| e.into_inner());
        let failed: Vec<StorePath> = paths
            .iter()
            .filter(|p| failing.contains(p))
            .cloned()
            .collect();

        if failed.is_empty() {
            return Ok(());
        }

        warn!(failed = failed.len(), "builds failed");
        Err(Error::BuildFailure {
            paths: failed,
            reason: "marked as failing".to_string(),
        })
    }
}
