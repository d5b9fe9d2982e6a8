use std::path::Path;

use super::{Error, Fetcher, Tree};
use crate::flakeref::FlakeRef;

/// Serves trees registered upfront. A registered reference also serves
/// every more specific (branch or revision pinned) reference to the same
/// location.
#[derive(Debug, Default, Clone)]
pub struct MemoryFetcher {
    trees: Vec<(FlakeRef, Tree, FlakeRef)>,
}

impl MemoryFetcher {
    /// Registers `tree` for `input`; fetching it returns `locked`.
    pub fn insert(&mut self, input: FlakeRef, tree: Tree, locked: FlakeRef) {
        self.trees.push((input, tree, locked));
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, input: &FlakeRef) -> Result<(Tree, FlakeRef), Error> {
        if !input.is_direct() {
            return Err(Error::Indirect(input.clone()));
        }

        self.trees
            .iter()
            .find(|(key, _, _)| key == input)
            .or_else(|| self.trees.iter().find(|(key, _, _)| key.matches(input)))
            .map(|(_, tree, locked)| (tree.clone(), locked.clone()))
            .ok_or_else(|| Error::NotFound {
                input: input.clone(),
                path: Default::default(),
            })
    }

    fn clone_to(&self, input: &FlakeRef, _dest: &Path) -> Result<(), Error> {
        Err(Error::Unsupported(input.clone()))
    }
}
