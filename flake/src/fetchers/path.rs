use std::{
    fs,
    io::{self, Read},
    os::unix::fs::PermissionsExt,
    path::Path,
    time::UNIX_EPOCH,
};

use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use super::{Error, Fetcher, SourceInfo, Tree};
use crate::{flakeref::FlakeRef, store_path::StorePath};

/// Fetches `path:` references by using the directory in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathFetcher;

/// Hashes a directory tree, returning its sha256 digest and the most recent
/// modification time found in it.
///
/// Entries are visited in file name order; file names, types, the
/// executable bit, symlink targets and file contents all contribute to the
/// digest. Modification times do not.
pub fn hash_tree(root: &Path) -> io::Result<([u8; 32], Option<i64>)> {
    let mut hasher = Sha256::new();
    let mut last_modified: Option<i64> = None;

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        let metadata = entry.metadata().map_err(io::Error::from)?;

        if let Ok(modified) = metadata.modified() {
            if let Ok(age) = modified.duration_since(UNIX_EPOCH) {
                let secs = age.as_secs() as i64;
                last_modified = Some(last_modified.map_or(secs, |m| m.max(secs)));
            }
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"d\0");
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            hasher.update(b"l\0");
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else {
            let executable = metadata.permissions().mode() & 0o111 != 0;
            hasher.update(if executable { b"x\0" } else { b"f\0" });
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
            hasher.update(metadata.len().to_le_bytes());

            let mut file = fs::File::open(entry.path())?;
            let mut buf = [0u8; 8192];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
    }

    Ok((hasher.finalize().into(), last_modified))
}

/// Builds the [SourceInfo] of a local directory.
pub(super) fn source_info(input: &FlakeRef, root: &Path) -> Result<SourceInfo, Error> {
    let (digest, last_modified) = hash_tree(root).map_err(|source| Error::Io {
        input: input.clone(),
        source,
    })?;
    let store_path =
        StorePath::for_source(&digest, "source").map_err(|source| Error::StorePath {
            input: input.clone(),
            source,
        })?;

    Ok(SourceInfo {
        store_path,
        rev: None,
        rev_count: None,
        last_modified,
    })
}

/// Recursively copies `src` to `dest`, keeping symlinks as symlinks.
pub(super) fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let target = dest.join(entry.path().strip_prefix(src).unwrap_or(entry.path()));
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

impl Fetcher for PathFetcher {
    #[instrument(skip(self), fields(input = %input), err)]
    fn fetch(&self, input: &FlakeRef) -> Result<(Tree, FlakeRef), Error> {
        let FlakeRef::Path { path } = input else {
            return Err(Error::Unsupported(input.clone()));
        };

        if !path.is_dir() {
            return Err(Error::NotFound {
                input: input.clone(),
                path: path.clone(),
            });
        }

        let info = source_info(input, path)?;
        debug!(store_path = %info.store_path, "hashed local source tree");

        Ok((
            Tree {
                actual_path: path.clone(),
                info,
            },
            input.clone(),
        ))
    }

    #[instrument(skip(self), fields(input = %input), err)]
    fn clone_to(&self, input: &FlakeRef, dest: &Path) -> Result<(), Error> {
        let FlakeRef::Path { path } = input else {
            return Err(Error::Unsupported(input.clone()));
        };

        copy_tree(path, dest).map_err(|source| Error::Io {
            input: input.clone(),
            source,
        })
    }
}
