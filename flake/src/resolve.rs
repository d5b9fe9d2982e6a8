//! Resolution of flake references through the registry chain.

use tracing::{instrument, trace};

use crate::{
    errors::{Error, Result},
    fetchers::{Fetcher, Tree},
    flakeref::FlakeRef,
    registry::{Registry, RegistryKind},
};

/// The registries consulted during resolution, in precedence order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registries(Vec<Registry>);

impl Registries {
    /// Orders `registries` by precedence: flags first, then the user
    /// registry, then the global one. Registries of the same kind keep
    /// their relative order.
    pub fn new(mut registries: Vec<Registry>) -> Self {
        registries.sort_by_key(Registry::kind);
        Registries(registries)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registry> {
        self.0.iter()
    }

    /// Finds the first entry matching `input`, looking at all registries
    /// in precedence order.
    fn lookup(&self, input: &FlakeRef) -> Option<(RegistryKind, &FlakeRef)> {
        self.0
            .iter()
            .find_map(|r| r.lookup(input).map(|entry| (r.kind(), &entry.to)))
    }

    /// Rewrites `input` until it is a direct reference.
    ///
    /// After every hop the lookup restarts at the highest-precedence
    /// registry, so a flag or user entry can override any step of a chain
    /// of global entries. Branches and revisions given on the looked up
    /// reference are carried over to its replacement.
    #[instrument(skip(self), fields(input = %input), err)]
    pub fn resolve(&self, input: &FlakeRef) -> Result<FlakeRef> {
        let mut current = input.clone();
        let mut visited: Vec<FlakeRef> = Vec::new();

        while !current.is_direct() {
            if visited.contains(&current) {
                visited.push(current);
                return Err(Error::IndirectionCycle(visited));
            }

            let (kind, to) = self
                .lookup(&current)
                .ok_or_else(|| Error::UnresolvableReference(current.clone()))?;
            trace!(from = %current, to = %to, registry = %kind, "registry hop");

            let next = to.apply_overrides(current.git_ref(), current.rev())?;
            visited.push(std::mem::replace(&mut current, next));
        }

        Ok(current)
    }
}

/// A reference with all indirection removed, together with the tree it
/// was fetched to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedInput {
    /// The reference as given by the user.
    pub original: FlakeRef,
    /// The direct reference, locked to what was fetched.
    pub locked: FlakeRef,
    pub tree: Tree,
}

/// Resolves `input` through `registries` and fetches the result.
#[instrument(skip(registries, fetcher), fields(input = %input), err)]
pub fn resolve_and_fetch<F>(
    registries: &Registries,
    fetcher: &F,
    input: &FlakeRef,
) -> Result<ResolvedInput>
where
    F: Fetcher + ?Sized,
{
    let direct = registries.resolve(input)?;
    let (tree, locked) = fetcher.fetch(&direct)?;

    Ok(ResolvedInput {
        original: input.clone(),
        locked,
        tree,
    })
}
