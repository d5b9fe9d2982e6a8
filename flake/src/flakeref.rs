//! Flake references.
//!
//! A [FlakeRef] either describes where to fetch a flake from (a
//! *direct* reference, such as `github:NixOS/nixpkgs` or
//! `path:/src/foo`), or is a symbolic name (an *indirect* reference,
//! such as `nixpkgs/release-19.09`) that only becomes fetchable after
//! going through the flake registries.
//!
//! References have two serialised forms: the URL-like string form used
//! on the command line ([FlakeRef::parse] and [std::fmt::Display]), and
//! an attribute form (`{"type": "github", "owner": ..}`) used in
//! registry and lock files, implemented through serde.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use data_encoding::HEXLOWER;
use path_clean::PathClean;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("'{0}' is not a valid flake reference")]
    Invalid(String),
    #[error("'{0}' is not a valid flake id")]
    InvalidId(String),
    #[error("'{0}' is not a valid branch or tag name")]
    InvalidRef(String),
    #[error("'{0}' is not a valid revision, expected 40 hexadecimal digits")]
    InvalidRev(String),
    #[error("unable to parse URL in '{input}': {error}")]
    InvalidUrl { input: String, error: url::ParseError },
    #[error("unsupported attribute '{attr}' in flake reference '{input}'")]
    UnsupportedAttribute { input: String, attr: String },
    #[error("relative path '{0}' needs a base directory to be resolved against")]
    RelativePath(String),
    #[error("flake reference '{0}' does not accept a branch or revision")]
    CannotOverride(String),
}

/// A git commit hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rev([u8; 20]);

impl Rev {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Rev(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Whether `s` has the shape of a full hexadecimal revision.
    fn looks_like_rev(s: &str) -> bool {
        s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl FromStr for Rev {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Rev::looks_like_rev(s) {
            return Err(Error::InvalidRev(s.to_string()));
        }
        let bytes = HEXLOWER
            .decode(s.to_ascii_lowercase().as_bytes())
            .map_err(|_| Error::InvalidRev(s.to_string()))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::InvalidRev(s.to_string()))?;
        Ok(Rev(bytes))
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rev({})", self)
    }
}

impl Serialize for Rev {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rev {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A parsed flake reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FlakeRef {
    /// A symbolic name that needs to be looked up in the registries.
    Indirect {
        id: String,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        git_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rev: Option<Rev>,
    },

    /// A directory on the local file system. Always absolute.
    Path { path: PathBuf },

    /// A git repository, reachable through the transport URL.
    Git {
        url: Url,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        git_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rev: Option<Rev>,
    },

    /// A repository hosted on GitHub.
    #[serde(rename = "github")]
    GitHub {
        owner: String,
        repo: String,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        git_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rev: Option<Rev>,
    },

    /// A (possibly compressed) tarball.
    Tarball { url: Url },
}

fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_valid_ref(r: &str) -> bool {
    let mut bytes = r.bytes();
    matches!(bytes.next(), Some(c) if c.is_ascii_alphanumeric() || c == b'@')
        && bytes.all(|c| c.is_ascii_alphanumeric() || b"_.-/@".contains(&c))
        && !r.contains("..")
}

/// Splits a trailing `ref-or-rev` path component into its ref or rev.
fn parse_ref_or_rev(s: &str) -> Result<(Option<String>, Option<Rev>), Error> {
    if Rev::looks_like_rev(s) {
        Ok((None, Some(s.parse()?)))
    } else if is_valid_ref(s) {
        Ok((Some(s.to_string()), None))
    } else {
        Err(Error::InvalidRef(s.to_string()))
    }
}

impl FlakeRef {
    /// Parses a flake reference. Relative paths (`.`, `./foo`) are made
    /// absolute against `base`, and rejected if no base is given.
    pub fn parse(input: &str, base: Option<&Path>) -> Result<Self, Error> {
        if let Some(path) = input.strip_prefix("path:") {
            return Self::parse_path(input, path, base);
        }

        if input.starts_with('/') || input.starts_with('.') {
            return Self::parse_path(input, input, base);
        }

        if let Some(rest) = input.strip_prefix("flake:") {
            return Self::parse_indirect(input, rest);
        }

        if let Some(rest) = input.strip_prefix("github:") {
            return Self::parse_github(input, rest);
        }

        if let Some(rest) = input.strip_prefix("git+") {
            return Self::parse_git(input, rest);
        }

        if ["http://", "https://", "file://"]
            .iter()
            .any(|scheme| input.starts_with(scheme))
        {
            let url = Url::parse(input).map_err(|error| Error::InvalidUrl {
                input: input.to_string(),
                error,
            })?;
            return Ok(FlakeRef::Tarball { url });
        }

        if input.contains(':') {
            return Err(Error::Invalid(input.to_string()));
        }

        Self::parse_indirect(input, input)
    }

    fn parse_path(input: &str, path: &str, base: Option<&Path>) -> Result<Self, Error> {
        if path.is_empty() {
            return Err(Error::Invalid(input.to_string()));
        }

        let path = Path::new(path);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.ok_or_else(|| Error::RelativePath(input.to_string()))?
                .join(path)
        };

        Ok(FlakeRef::Path { path: path.clean() })
    }

    fn parse_indirect(input: &str, rest: &str) -> Result<Self, Error> {
        let mut parts = rest.split('/');
        let id = parts.next().unwrap_or_default();
        if !is_valid_id(id) {
            return Err(Error::InvalidId(id.to_string()));
        }

        let (git_ref, rev) = match (parts.next(), parts.next(), parts.next()) {
            (None, _, _) => (None, None),
            (Some(ref_or_rev), None, _) => parse_ref_or_rev(ref_or_rev)?,
            (Some(git_ref), Some(rev), None) if is_valid_ref(git_ref) => {
                (Some(git_ref.to_string()), Some(rev.parse()?))
            }
            _ => return Err(Error::Invalid(input.to_string())),
        };

        Ok(FlakeRef::Indirect {
            id: id.to_string(),
            git_ref,
            rev,
        })
    }

    fn parse_github(input: &str, rest: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = rest.split('/').collect();
        let (owner, repo, git_ref, rev) = match parts.as_slice() {
            [owner, repo] => (*owner, *repo, None, None),
            [owner, repo, ref_or_rev] => {
                let (git_ref, rev) = parse_ref_or_rev(ref_or_rev)?;
                (*owner, *repo, git_ref, rev)
            }
            [owner, repo, git_ref, rev] if is_valid_ref(git_ref) => {
                (*owner, *repo, Some(git_ref.to_string()), Some(rev.parse()?))
            }
            _ => return Err(Error::Invalid(input.to_string())),
        };

        if owner.is_empty() || repo.is_empty() {
            return Err(Error::Invalid(input.to_string()));
        }

        Ok(FlakeRef::GitHub {
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref,
            rev,
        })
    }

    fn parse_git(input: &str, rest: &str) -> Result<Self, Error> {
        let mut url = Url::parse(rest).map_err(|error| Error::InvalidUrl {
            input: input.to_string(),
            error,
        })?;

        if !matches!(url.scheme(), "file" | "http" | "https" | "ssh") {
            return Err(Error::Invalid(input.to_string()));
        }

        let mut git_ref = None;
        let mut rev = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "ref" if is_valid_ref(&value) => git_ref = Some(value.into_owned()),
                "ref" => return Err(Error::InvalidRef(value.into_owned())),
                "rev" => rev = Some(value.parse()?),
                attr => {
                    return Err(Error::UnsupportedAttribute {
                        input: input.to_string(),
                        attr: attr.to_string(),
                    })
                }
            }
        }
        url.set_query(None);

        Ok(FlakeRef::Git { url, git_ref, rev })
    }

    /// Direct references can be fetched without consulting a registry.
    pub fn is_direct(&self) -> bool {
        !matches!(self, FlakeRef::Indirect { .. })
    }

    pub fn git_ref(&self) -> Option<&str> {
        match self {
            FlakeRef::Indirect { git_ref, .. }
            | FlakeRef::Git { git_ref, .. }
            | FlakeRef::GitHub { git_ref, .. } => git_ref.as_deref(),
            FlakeRef::Path { .. } | FlakeRef::Tarball { .. } => None,
        }
    }

    pub fn rev(&self) -> Option<&Rev> {
        match self {
            FlakeRef::Indirect { rev, .. }
            | FlakeRef::Git { rev, .. }
            | FlakeRef::GitHub { rev, .. } => rev.as_ref(),
            FlakeRef::Path { .. } | FlakeRef::Tarball { .. } => None,
        }
    }

    /// Returns this reference with its branch and revision removed.
    pub fn unpinned(&self) -> FlakeRef {
        let mut r = self.clone();
        match &mut r {
            FlakeRef::Indirect { git_ref, rev, .. }
            | FlakeRef::Git { git_ref, rev, .. }
            | FlakeRef::GitHub { git_ref, rev, .. } => {
                *git_ref = None;
                *rev = None;
            }
            FlakeRef::Path { .. } | FlakeRef::Tarball { .. } => {}
        }
        r
    }

    /// Whether `other` is covered by this reference when it is used as the
    /// `from` side of a registry entry: both point to the same location, and
    /// everything this reference pins is pinned identically by `other`.
    pub fn matches(&self, other: &FlakeRef) -> bool {
        self.unpinned() == other.unpinned()
            && self.git_ref().map_or(true, |r| other.git_ref() == Some(r))
            && self.rev().map_or(true, |r| other.rev() == Some(r))
    }

    /// Applies a branch and revision to this reference, unless it already
    /// pins its own.
    pub fn apply_overrides(
        &self,
        new_ref: Option<&str>,
        new_rev: Option<&Rev>,
    ) -> Result<FlakeRef, Error> {
        if new_ref.is_none() && new_rev.is_none() {
            return Ok(self.clone());
        }

        let mut r = self.clone();
        match &mut r {
            FlakeRef::Indirect { git_ref, rev, .. }
            | FlakeRef::Git { git_ref, rev, .. }
            | FlakeRef::GitHub { git_ref, rev, .. } => {
                if git_ref.is_none() {
                    *git_ref = new_ref.map(str::to_string);
                }
                if rev.is_none() {
                    *rev = new_rev.copied();
                }
            }
            FlakeRef::Path { .. } | FlakeRef::Tarball { .. } => {
                return Err(Error::CannotOverride(self.to_string()))
            }
        }
        Ok(r)
    }
}

impl FromStr for FlakeRef {
    type Err = Error;

    /// Parses a flake reference, rejecting relative paths.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlakeRef::parse(s, None)
    }
}

impl fmt::Display for FlakeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlakeRef::Indirect { id, git_ref, rev } => {
                write!(f, "flake:{id}")?;
                if let Some(git_ref) = git_ref {
                    write!(f, "/{git_ref}")?;
                }
                if let Some(rev) = rev {
                    write!(f, "/{rev}")?;
                }
                Ok(())
            }
            FlakeRef::Path { path } => write!(f, "path:{}", path.display()),
            FlakeRef::Git { url, git_ref, rev } => {
                let mut url = url.clone();
                if git_ref.is_some() || rev.is_some() {
                    let mut query = url.query_pairs_mut();
                    if let Some(git_ref) = git_ref {
                        query.append_pair("ref", git_ref);
                    }
                    if let Some(rev) = rev {
                        query.append_pair("rev", &rev.to_string());
                    }
                }
                write!(f, "git+{url}")
            }
            FlakeRef::GitHub {
                owner,
                repo,
                git_ref,
                rev,
            } => {
                write!(f, "github:{owner}/{repo}")?;
                if let Some(git_ref) = git_ref {
                    write!(f, "/{git_ref}")?;
                }
                if let Some(rev) = rev {
                    write!(f, "/{rev}")?;
                }
                Ok(())
            }
            FlakeRef::Tarball { url } => write!(f, "{url}"),
        }
    }
}
