use std::{path::PathBuf, process::Command};

use tracing::{debug, instrument};

use super::{Error, Store};
use crate::store_path::StorePath;

/// Builds by running `nix-store --realise` on the local machine.
#[derive(Debug)]
pub struct NixStore {
    nix_store_bin: PathBuf,
}

impl Default for NixStore {
    fn default() -> Self {
        NixStore {
            nix_store_bin: "nix-store".into(),
        }
    }
}

impl NixStore {
    pub fn new(nix_store_bin: PathBuf) -> Self {
        NixStore { nix_store_bin }
    }
}

impl Store for NixStore {
    #[instrument(skip(self), fields(paths = paths.len()), err)]
    fn build(&self, paths: &[StorePath]) -> Result<(), Error> {
        if paths.is_empty() {
            return Ok(());
        }

        let output = Command::new(&self.nix_store_bin)
            .arg("--realise")
            .args(paths.iter().map(StorePath::to_absolute_path))
            .output()
            .map_err(|e| Error::BuildFailure {
                paths: paths.to_vec(),
                reason: format!("unable to run {}: {e}", self.nix_store_bin.display()),
            })?;

        if !output.status.success() {
            return Err(Error::BuildFailure {
                paths: paths.to_vec(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(
            outputs = %String::from_utf8_lossy(&output.stdout).trim(),
            "realised"
        );
        Ok(())
    }
}
