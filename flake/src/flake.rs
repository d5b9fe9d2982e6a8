//! Loading flakes: resolve, fetch, evaluate.

use std::{collections::BTreeMap, path::PathBuf};

use tracing::{debug, instrument};

use crate::{
    errors::{Error, Result},
    eval::{Evaluator, Pos},
    fetchers::{Fetcher, SourceInfo},
    flakeref::FlakeRef,
    resolve::{resolve_and_fetch, Registries, ResolvedInput},
};

/// The newest edition this crate understands.
pub const SUPPORTED_EDITION: u64 = 201909;

/// A loaded flake. `outputs` is still unevaluated.
#[derive(Clone, Debug, PartialEq)]
pub struct Flake<V> {
    pub original: FlakeRef,
    /// The direct reference the flake was fetched from, locked to the
    /// fetched revision where there is one.
    pub locked: FlakeRef,
    pub description: Option<String>,
    pub edition: u64,
    pub source_info: SourceInfo,
    /// Where the source tree can be read locally.
    pub tree_path: PathBuf,
    /// Declared inputs, by name.
    pub inputs: BTreeMap<String, String>,
    pub outputs: V,
    pub outputs_pos: Pos,
}

/// Bundles what is needed to turn references into flakes: the
/// registries to resolve through, the fetch backend and the evaluator.
#[derive(Debug)]
pub struct Loader<F, E> {
    registries: Registries,
    fetcher: F,
    evaluator: E,
}

impl<F, E> Loader<F, E>
where
    F: Fetcher,
    E: Evaluator,
{
    pub fn new(registries: Registries, fetcher: F, evaluator: E) -> Self {
        Loader {
            registries,
            fetcher,
            evaluator,
        }
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    /// Resolves `input` through the registries and fetches it.
    pub fn resolve(&self, input: &FlakeRef) -> Result<ResolvedInput> {
        resolve_and_fetch(&self.registries, &self.fetcher, input)
    }

    /// Resolves, fetches and evaluates the flake at `input`.
    #[instrument(skip(self), fields(input = %input), err)]
    pub fn get_flake(&self, input: &FlakeRef) -> Result<Flake<E::Value>> {
        let resolved = self.resolve(input)?;
        self.load(resolved)
    }

    /// Evaluates an already fetched flake.
    pub fn load(&self, resolved: ResolvedInput) -> Result<Flake<E::Value>> {
        let manifest = self.evaluator.eval_flake(&resolved.tree)?;

        let edition = manifest
            .edition
            .ok_or_else(|| Error::MissingEdition(resolved.original.clone()))?;
        if edition > SUPPORTED_EDITION {
            return Err(Error::UnsupportedEdition {
                input: resolved.original,
                edition,
            });
        }

        debug!(
            locked = %resolved.locked,
            store_path = %resolved.tree.info.store_path,
            "loaded flake"
        );

        Ok(Flake {
            original: resolved.original,
            locked: resolved.locked,
            description: manifest.description,
            edition,
            source_info: resolved.tree.info,
            tree_path: resolved.tree.actual_path,
            inputs: manifest.inputs,
            outputs: manifest.outputs,
            outputs_pos: manifest.outputs_pos,
        })
    }
}
