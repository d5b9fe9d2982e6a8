//! Lock graphs and their persistence in `flake.lock`.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    errors,
    eval::Evaluator,
    fetchers::Fetcher,
    flake::{Flake, Loader},
    flakeref::FlakeRef,
    store_path::StorePath,
};

pub const LOCK_FILE: &str = "flake.lock";

/// The lock file format version written by this crate.
pub const LOCK_FILE_VERSION: u64 = 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to access lock file '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("unable to parse lock file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("lock file '{}' has unsupported version {version}", path.display())]
    UnsupportedVersion { path: PathBuf, version: u64 },
}

/// How an existing lock file is treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockFileMode {
    /// Keep entries that still match, lock the rest, write if anything
    /// changed.
    #[default]
    Update,
    /// Ignore the existing lock file and write a fresh one.
    Recreate,
    /// Keep entries that still match, lock the rest, never write.
    ReadOnly,
}

/// One node of the lock graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedInput {
    /// The reference as declared by the depending flake.
    pub original: FlakeRef,
    pub locked: FlakeRef,
    pub path: StorePath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, LockedInput>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    version: u64,
    #[serde(default)]
    pub inputs: BTreeMap<String, LockedInput>,
}

impl Default for LockFile {
    fn default() -> Self {
        LockFile {
            version: LOCK_FILE_VERSION,
            inputs: BTreeMap::new(),
        }
    }
}

impl LockFile {
    pub fn new(inputs: BTreeMap<String, LockedInput>) -> Self {
        LockFile {
            version: LOCK_FILE_VERSION,
            inputs,
        }
    }

    /// Reads a lock file. A missing file is an empty lock file.
    pub fn read(path: &Path) -> Result<Self, Error> {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockFile::default()),
            Err(source) => {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let lock_file: LockFile =
            serde_json::from_slice(&contents).map_err(|source| Error::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if lock_file.version != LOCK_FILE_VERSION {
            return Err(Error::UnsupportedVersion {
                path: path.to_path_buf(),
                version: lock_file.version,
            });
        }

        Ok(lock_file)
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let io_err = |source| Error::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut contents = serde_json::to_vec_pretty(self).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        contents.push(b'\n');

        fs::write(path, contents).map_err(io_err)
    }
}

/// A flake together with the locks of all its transitive inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct LockedFlake<V> {
    pub flake: Flake<V>,
    pub lock_file: LockFile,
    /// Whether `flake.lock` was (re)written.
    pub written: bool,
}

/// The directory a flake can be edited in, for local flakes.
fn local_dir(locked: &FlakeRef) -> Option<PathBuf> {
    match locked {
        FlakeRef::Path { path } => Some(path.clone()),
        FlakeRef::Git { url, .. } if url.scheme() == "file" => url.to_file_path().ok(),
        _ => None,
    }
}

impl<F, E> Loader<F, E>
where
    F: Fetcher,
    E: Evaluator,
{
    /// Loads the flake at `input` and locks all its inputs, recursively.
    #[instrument(skip(self), fields(input = %input), err)]
    pub fn lock_flake(
        &self,
        input: &FlakeRef,
        mode: LockFileMode,
    ) -> errors::Result<LockedFlake<E::Value>> {
        let flake = self.get_flake(input)?;

        let local_dir = local_dir(&flake.locked);
        let lock_path = local_dir
            .as_deref()
            .unwrap_or(&flake.tree_path)
            .join(LOCK_FILE);

        let old = match mode {
            LockFileMode::Recreate => LockFile::default(),
            LockFileMode::Update | LockFileMode::ReadOnly => LockFile::read(&lock_path)?,
        };

        let mut ancestors = vec![flake.locked.clone()];
        let inputs = self.lock_inputs(
            &flake.inputs,
            &old.inputs,
            &flake.tree_path,
            &mut ancestors,
        )?;
        let lock_file = LockFile::new(inputs);

        let changed = mode == LockFileMode::Recreate || lock_file != old;
        let written = match (changed, mode, local_dir) {
            (false, _, _) => false,
            (true, LockFileMode::ReadOnly, _) => {
                warn!(path = %lock_path.display(), "lock file is out of date, not writing it");
                false
            }
            (true, _, None) => {
                warn!(flake = %flake.locked, "cannot write lock file of a non-local flake");
                false
            }
            (true, _, Some(_)) => {
                lock_file.write(&lock_path)?;
                info!(path = %lock_path.display(), "updated lock file");
                true
            }
        };

        Ok(LockedFlake {
            flake,
            lock_file,
            written,
        })
    }

    fn lock_inputs(
        &self,
        declared: &BTreeMap<String, String>,
        existing: &BTreeMap<String, LockedInput>,
        base: &Path,
        ancestors: &mut Vec<FlakeRef>,
    ) -> errors::Result<BTreeMap<String, LockedInput>> {
        let mut locked_inputs = BTreeMap::new();

        for (name, url) in declared {
            let original = FlakeRef::parse(url, Some(base))?;

            if let Some(old) = existing.get(name).filter(|old| old.original == original) {
                debug!(input = %name, locked = %old.locked, "keeping locked input");
                locked_inputs.insert(name.clone(), old.clone());
                continue;
            }

            let resolved = self.resolve(&original)?;
            if ancestors.contains(&resolved.locked) {
                let mut chain = ancestors.clone();
                chain.push(resolved.locked);
                return Err(errors::Error::LockCycle(chain));
            }

            let dep = self.load(resolved)?;
            debug!(input = %name, locked = %dep.locked, "locked input");

            ancestors.push(dep.locked.clone());
            let inputs =
                self.lock_inputs(&dep.inputs, &BTreeMap::new(), &dep.tree_path, ancestors)?;
            ancestors.pop();

            locked_inputs.insert(
                name.clone(),
                LockedInput {
                    original,
                    locked: dep.locked,
                    path: dep.source_info.store_path,
                    rev_count: dep.source_info.rev_count,
                    last_modified: dep.source_info.last_modified,
                    inputs,
                },
            );
        }

        Ok(locked_inputs)
    }
}
