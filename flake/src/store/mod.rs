//! The boundary to the store that builds artifacts.

use thiserror::Error;

use crate::store_path::StorePath;

mod dummy;
mod from_addr;
mod memory;
mod nix_store;

pub use self::dummy::DummyStore;
pub use self::from_addr::from_addr;
pub use self::memory::MemoryStore;
pub use self::nix_store::NixStore;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to parse store address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("building is not supported by this store")]
    Unsupported,

    #[error("failed to build {}: {reason}", display_paths(.paths))]
    BuildFailure {
        paths: Vec<StorePath>,
        reason: String,
    },
}

fn display_paths(paths: &[StorePath]) -> String {
    paths
        .iter()
        .map(|p| format!("'{}'", p.to_absolute_path()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub trait Store {
    /// Builds all `paths`, failing if any of them fails.
    fn build(&self, paths: &[StorePath]) -> Result<(), Error>;

    fn print_path(&self, path: &StorePath) -> String {
        path.to_absolute_path()
    }
}

impl<S: Store + ?Sized> Store for &S {
    fn build(&self, paths: &[StorePath]) -> Result<(), Error> {
        (**self).build(paths)
    }

    fn print_path(&self, path: &StorePath) -> String {
        (**self).print_path(path)
    }
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn build(&self, paths: &[StorePath]) -> Result<(), Error> {
        (**self).build(paths)
    }

    fn print_path(&self, path: &StorePath) -> String {
        (**self).print_path(path)
    }
}
