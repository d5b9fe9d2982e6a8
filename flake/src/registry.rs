//! Flake registries map (usually indirect) flake references to other
//! flake references.
//!
//! There are three kinds of registries, consulted in this order:
//! - the flag registry, built from command line overrides and only
//!   living for one invocation,
//! - the user registry, the only one that is ever written to,
//! - the global registry, shared by all users of a machine.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::flakeref::FlakeRef;

/// The registry file format version written by this crate.
pub const REGISTRY_VERSION: u64 = 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to access registry '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("unable to parse registry '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("registry '{}' has unsupported version {version}", path.display())]
    UnsupportedVersion { path: PathBuf, version: u64 },

    #[error("unable to lock registry '{}': {source}", path.display())]
    Lock { path: PathBuf, source: nix::Error },
}

/// The provenance of a [Registry], which also determines its precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegistryKind {
    Flag,
    User,
    Global,
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegistryKind::Flag => "flags",
            RegistryKind::User => "user",
            RegistryKind::Global => "global",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub from: FlakeRef,
    pub to: FlakeRef,
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u64,
    #[serde(default)]
    flakes: Vec<Entry>,
}

/// An ordered list of registry entries of one [RegistryKind].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registry {
    kind: RegistryKind,
    entries: Vec<Entry>,
}

impl Registry {
    pub fn new(kind: RegistryKind) -> Self {
        Registry {
            kind,
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Reads a registry from disk. A missing file is an empty registry.
    #[instrument(err)]
    pub fn read(path: &Path, kind: RegistryKind) -> Result<Self, Error> {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "registry does not exist, using empty registry");
                return Ok(Registry::new(kind));
            }
            Err(source) => {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let file: RegistryFile =
            serde_json::from_slice(&contents).map_err(|source| Error::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if file.version != REGISTRY_VERSION {
            return Err(Error::UnsupportedVersion {
                path: path.to_path_buf(),
                version: file.version,
            });
        }

        Ok(Registry {
            kind,
            entries: file.flakes,
        })
    }

    /// Replaces the registry file at `path` with the contents of this
    /// registry. The new contents are written to a sibling file first and
    /// then moved into place.
    #[instrument(skip(self), fields(kind = %self.kind), err)]
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let io_err = |source| Error::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file = RegistryFile {
            version: REGISTRY_VERSION,
            flakes: self.entries.clone(),
        };
        let mut contents = serde_json::to_vec_pretty(&file).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        contents.push(b'\n');

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents).map_err(io_err)?;
        fs::rename(&tmp_path, path).map_err(io_err)?;

        Ok(())
    }

    /// Appends an entry, without looking at existing ones.
    pub fn add(&mut self, from: FlakeRef, to: FlakeRef) {
        self.entries.push(Entry { from, to });
    }

    /// Replaces all entries for `from` by a single one pointing to `to`.
    pub fn upsert(&mut self, from: FlakeRef, to: FlakeRef) {
        self.remove(&from);
        self.add(from, to);
    }

    /// Removes all entries for `from`. Removing an absent entry is not an
    /// error.
    pub fn remove(&mut self, from: &FlakeRef) {
        self.entries.retain(|entry| &entry.from != from);
    }

    /// Returns the first entry matching `input`.
    pub fn lookup(&self, input: &FlakeRef) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.from.matches(input))
    }
}

/// An exclusive advisory lock guarding a registry file against concurrent
/// read-modify-write cycles of other processes. Released on drop.
#[derive(Debug)]
pub struct RegistryLock {
    _file: File,
}

impl RegistryLock {
    /// Blocks until `<registry_path>.lock` is locked.
    #[instrument(err)]
    pub fn acquire(registry_path: &Path) -> Result<Self, Error> {
        let mut lock_path = registry_path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        let io_err = |source| Error::Io {
            path: lock_path.clone(),
            source,
        };

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err)?;

        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|source| Error::Lock {
            path: lock_path.clone(),
            source,
        })?;

        Ok(RegistryLock { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{Error, Registry, RegistryKind, RegistryLock};
    use crate::flakeref::FlakeRef;

    fn r(s: &str) -> FlakeRef {
        s.parse().expect("valid flake ref")
    }

    #[test]
    fn upsert_replaces() {
        let mut registry = Registry::new(RegistryKind::User);
        registry.upsert(r("a"), r("github:org/b"));
        registry.upsert(r("a"), r("github:org/c"));

        assert_eq!(1, registry.entries().len());
        assert_eq!(r("github:org/c"), registry.entries()[0].to);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = Registry::new(RegistryKind::User);
        registry.upsert(r("a"), r("github:org/b"));
        registry.upsert(r("other"), r("github:org/other"));

        registry.remove(&r("a"));
        assert!(registry.lookup(&r("a")).is_none());

        registry.remove(&r("a"));
        assert!(registry.lookup(&r("a")).is_none());
        assert_eq!(1, registry.entries().len());
    }

    #[test]
    fn lookup_returns_first_match() {
        let mut registry = Registry::new(RegistryKind::Global);
        registry.add(r("nixpkgs"), r("github:NixOS/nixpkgs"));
        registry.add(r("nixpkgs"), r("github:someone/nixpkgs"));

        assert_eq!(
            r("github:NixOS/nixpkgs"),
            registry.lookup(&r("nixpkgs/master")).unwrap().to
        );
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/registry.json");

        let mut registry = Registry::new(RegistryKind::User);
        registry.add(r("nixpkgs"), r("github:NixOS/nixpkgs/release-19.09"));
        registry.add(r("src"), r("path:/src"));
        registry.write(&path).expect("write must succeed");

        assert_eq!(
            registry,
            Registry::read(&path, RegistryKind::User).expect("read must succeed")
        );
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::read(&dir.path().join("nope.json"), RegistryKind::Global)
            .expect("read must succeed");
        assert!(registry.entries().is_empty());
        assert_eq!(RegistryKind::Global, registry.kind());
    }

    #[test]
    fn rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, r#"{"version": 1, "flakes": []}"#).unwrap();

        assert!(matches!(
            Registry::read(&path, RegistryKind::User),
            Err(Error::UnsupportedVersion { version: 1, .. })
        ));
    }

    #[test]
    fn file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut registry = Registry::new(RegistryKind::User);
        registry.add(r("nixpkgs"), r("github:NixOS/nixpkgs"));
        registry.write(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            serde_json::json!({
                "version": 2,
                "flakes": [{
                    "from": {"type": "indirect", "id": "nixpkgs"},
                    "to": {"type": "github", "owner": "NixOS", "repo": "nixpkgs"},
                }],
            }),
            json
        );
    }

    #[test]
    fn lock_can_be_reacquired_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let lock = RegistryLock::acquire(&path).expect("lock must succeed");
        assert!(dir.path().join("registry.json.lock").exists());
        assert!(!dir.path().join("registry.lock").exists());
        drop(lock);
        RegistryLock::acquire(&path).expect("lock must succeed again");
    }
}
