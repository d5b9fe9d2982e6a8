//! Errors surfaced by the operations of this crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::{
    check, eval, fetchers,
    flakeref::{self, FlakeRef},
    lockfile, registry, store,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    FlakeRef(#[from] flakeref::Error),

    #[error(transparent)]
    Registry(#[from] registry::Error),

    #[error("cannot find flake '{0}' in the flake registries")]
    UnresolvableReference(FlakeRef),

    #[error("indirection cycle while resolving flake reference: {}", display_chain(.0))]
    IndirectionCycle(Vec<FlakeRef>),

    #[error(transparent)]
    Fetch(#[from] fetchers::Error),

    #[error(transparent)]
    Eval(#[from] eval::EvalError),

    #[error("flake '{0}' lacks attribute 'edition'")]
    MissingEdition(FlakeRef),

    #[error("flake '{input}' requires unsupported edition {edition}")]
    UnsupportedEdition { input: FlakeRef, edition: u64 },

    #[error("flake input cycle while locking: {}", display_chain(.0))]
    LockCycle(Vec<FlakeRef>),

    #[error(transparent)]
    LockFile(#[from] lockfile::Error),

    #[error(transparent)]
    Check(#[from] check::CheckError),

    #[error(transparent)]
    Store(#[from] store::Error),

    #[error("{0}")]
    Init(String),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn display_chain(chain: &[FlakeRef]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
