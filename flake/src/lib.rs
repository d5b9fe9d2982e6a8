//! Flake reference resolution and flake output validation.
//!
//! A [flakeref::FlakeRef] is resolved through the chain of
//! [registry::Registry]s ([resolve]), fetched by a [fetchers::Fetcher],
//! evaluated by an [eval::Evaluator] ([flake::Loader]) and finally its
//! outputs are validated ([check]) and optionally built by a
//! [store::Store].

pub mod check;
pub mod commands;
pub mod errors;
pub mod eval;
pub mod fetchers;
pub mod flake;
pub mod flakeref;
pub mod info;
pub mod lockfile;
pub mod nixbase32;
pub mod registry;
pub mod resolve;
pub mod settings;
pub mod store;
pub mod store_path;
pub mod systems;

pub use errors::{Error, Result};
