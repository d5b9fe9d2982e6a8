//! Fetch backends turn a direct [FlakeRef] into a source tree on the
//! local file system.
//!
//! Fetching is delegated to a [Fetcher]. The crate ships backends for
//! local directories (`path:`) and local git repositories
//! (`git+file:`), a [DefaultFetcher] dispatching between them, and an
//! in-memory [MemoryFetcher] serving pre-registered trees.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{
    flakeref::{FlakeRef, Rev},
    store_path::{self, StorePath},
};

mod git;
mod memory;
mod path;

pub use git::GitFetcher;
pub use memory::MemoryFetcher;
pub use path::{hash_tree, PathFetcher};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot fetch indirect flake reference '{0}'")]
    Indirect(FlakeRef),

    #[error("fetching '{0}' is not supported by this fetcher")]
    Unsupported(FlakeRef),

    #[error("source tree '{}' of '{input}' does not exist", path.display())]
    NotFound { input: FlakeRef, path: PathBuf },

    #[error("I/O error while fetching '{input}': {source}")]
    Io {
        input: FlakeRef,
        source: std::io::Error,
    },

    #[error("command '{command}' failed while fetching '{input}': {stderr}")]
    Command {
        input: FlakeRef,
        command: String,
        stderr: String,
    },

    #[error("unable to compute the store path for '{input}': {source}")]
    StorePath {
        input: FlakeRef,
        source: store_path::Error,
    },
}

/// Metadata about a fetched source tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    /// Content-addressed store path of the tree.
    pub store_path: StorePath,
    /// The commit the tree was taken from, for version controlled inputs.
    pub rev: Option<Rev>,
    /// Number of commits leading up to `rev`.
    pub rev_count: Option<u64>,
    /// Seconds since the epoch of the last modification.
    pub last_modified: Option<i64>,
}

/// A fetched source tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    /// Where the tree can be read from locally.
    pub actual_path: PathBuf,
    pub info: SourceInfo,
}

pub trait Fetcher {
    /// Materialises the tree `input` points to. Besides the tree, returns
    /// `input` locked to exactly what was fetched (e.g. with the revision
    /// filled in).
    fn fetch(&self, input: &FlakeRef) -> Result<(Tree, FlakeRef), Error>;

    /// Creates an editable checkout of `input` at `dest`.
    fn clone_to(&self, input: &FlakeRef, dest: &Path) -> Result<(), Error>;
}

impl<F: Fetcher + ?Sized> Fetcher for &F {
    fn fetch(&self, input: &FlakeRef) -> Result<(Tree, FlakeRef), Error> {
        (**self).fetch(input)
    }

    fn clone_to(&self, input: &FlakeRef, dest: &Path) -> Result<(), Error> {
        (**self).clone_to(input, dest)
    }
}

impl<F: Fetcher + ?Sized> Fetcher for Box<F> {
    fn fetch(&self, input: &FlakeRef) -> Result<(Tree, FlakeRef), Error> {
        (**self).fetch(input)
    }

    fn clone_to(&self, input: &FlakeRef, dest: &Path) -> Result<(), Error> {
        (**self).clone_to(input, dest)
    }
}

/// Dispatches to the backend responsible for the kind of reference.
#[derive(Debug, Default)]
pub struct DefaultFetcher {
    path: PathFetcher,
    git: GitFetcher,
}

impl DefaultFetcher {
    pub fn new(git: GitFetcher) -> Self {
        DefaultFetcher {
            path: PathFetcher,
            git,
        }
    }
}

impl Fetcher for DefaultFetcher {
    fn fetch(&self, input: &FlakeRef) -> Result<(Tree, FlakeRef), Error> {
        match input {
            FlakeRef::Indirect { .. } => Err(Error::Indirect(input.clone())),
            FlakeRef::Path { .. } => self.path.fetch(input),
            FlakeRef::Git { .. } => self.git.fetch(input),
            FlakeRef::GitHub { .. } | FlakeRef::Tarball { .. } => {
                Err(Error::Unsupported(input.clone()))
            }
        }
    }

    fn clone_to(&self, input: &FlakeRef, dest: &Path) -> Result<(), Error> {
        match input {
            FlakeRef::Indirect { .. } => Err(Error::Indirect(input.clone())),
            FlakeRef::Path { .. } => self.path.clone_to(input, dest),
            FlakeRef::Git { .. } | FlakeRef::GitHub { .. } => self.git.clone_to(input, dest),
            FlakeRef::Tarball { .. } => Err(Error::Unsupported(input.clone())),
        }
    }
}
