use url::Url;

use super::{DummyStore, Error, MemoryStore, NixStore, Store};

/// Constructs a new instance of a [Store] from an URI.
///
/// The following schemes are supported:
/// - `dummy://` ([DummyStore])
/// - `memory://` ([MemoryStore])
/// - `nix://` ([NixStore]), with an optional path to the `nix-store`
///   binary, e.g. `nix:///run/current-system/sw/bin/nix-store`.
pub fn from_addr(uri: &str) -> Result<Box<dyn Store>, Error> {
    let url = Url::parse(uri).map_err(|e| Error::InvalidAddress {
        addr: uri.to_string(),
        reason: e.to_string(),
    })?;

    Ok(match url.scheme() {
        // dummy and memory don't care about parameters.
        "dummy" => Box::<DummyStore>::default(),
        "memory" => Box::<MemoryStore>::default(),
        "nix" => {
            if url.path().is_empty() || url.path() == "/" {
                Box::<NixStore>::default()
            } else {
                Box::new(NixStore::new(url.path().into()))
            }
        }
        scheme => Err(Error::InvalidAddress {
            addr: uri.to_string(),
            reason: format!("unknown scheme: {scheme}"),
        })?,
    })
}
