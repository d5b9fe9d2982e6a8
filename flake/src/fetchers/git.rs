use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use tracing::{debug, instrument};

use super::{path::source_info, Error, Fetcher, Tree};
use crate::flakeref::{FlakeRef, Rev};

/// Fetches `git+file:` references by exporting the requested commit of
/// a local repository into a cache directory. Cloning is supported for
/// all git and GitHub references.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    cache_dir: PathBuf,
}

impl Default for GitFetcher {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tvix-flake")
            .join("git");
        GitFetcher { cache_dir }
    }
}

impl GitFetcher {
    pub fn new(cache_dir: PathBuf) -> Self {
        GitFetcher { cache_dir }
    }

    fn run(input: &FlakeRef, cmd: &mut Command) -> Result<String, Error> {
        let output = cmd.output().map_err(|source| Error::Io {
            input: input.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(Error::Command {
                input: input.clone(),
                command: format!("{cmd:?}"),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn git(input: &FlakeRef, repo: &Path, args: &[&str]) -> Result<String, Error> {
        Self::run(input, Command::new("git").arg("-C").arg(repo).args(args))
    }

    /// Writes the tree of `rev` into `dest` using `git archive`.
    fn export(input: &FlakeRef, repo: &Path, rev: &Rev, dest: &Path) -> Result<(), Error> {
        let io_err = |source| Error::Io {
            input: input.clone(),
            source,
        };

        let tmp = dest.with_extension("tmp");
        if tmp.exists() {
            fs::remove_dir_all(&tmp).map_err(io_err)?;
        }
        fs::create_dir_all(&tmp).map_err(io_err)?;

        let mut archive = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(["archive", "--format=tar", &rev.to_string()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(io_err)?;

        let archive_stdout = archive.stdout.take().ok_or_else(|| {
            io_err(std::io::Error::other("git archive has no stdout"))
        })?;

        Self::run(
            input,
            Command::new("tar")
                .arg("-x")
                .arg("-C")
                .arg(&tmp)
                .stdin(Stdio::from(archive_stdout)),
        )?;

        let archive_output = archive.wait_with_output().map_err(io_err)?;
        if !archive_output.status.success() {
            return Err(Error::Command {
                input: input.clone(),
                command: format!("git archive {rev}"),
                stderr: String::from_utf8_lossy(&archive_output.stderr)
                    .trim()
                    .to_string(),
            });
        }

        fs::rename(&tmp, dest).map_err(io_err)
    }
}

impl Fetcher for GitFetcher {
    #[instrument(skip(self), fields(input = %input), err)]
    fn fetch(&self, input: &FlakeRef) -> Result<(Tree, FlakeRef), Error> {
        let FlakeRef::Git { url, git_ref, rev } = input else {
            return Err(Error::Unsupported(input.clone()));
        };

        if url.scheme() != "file" {
            return Err(Error::Unsupported(input.clone()));
        }

        let repo = url
            .to_file_path()
            .map_err(|_| Error::Unsupported(input.clone()))?;
        if !repo.is_dir() {
            return Err(Error::NotFound {
                input: input.clone(),
                path: repo,
            });
        }

        let rev = match rev {
            Some(rev) => *rev,
            None => {
                let target = format!("{}^{{commit}}", git_ref.as_deref().unwrap_or("HEAD"));
                let out = Self::git(input, &repo, &["rev-parse", "--verify", &target])?;
                out.parse::<Rev>().map_err(|_| Error::Command {
                    input: input.clone(),
                    command: format!("git rev-parse {target}"),
                    stderr: format!("unexpected output '{out}'"),
                })?
            }
        };
        let rev_str = rev.to_string();

        let rev_count = Self::git(input, &repo, &["rev-list", "--count", &rev_str])?
            .parse::<u64>()
            .ok();
        let last_modified = Self::git(input, &repo, &["log", "-1", "--format=%ct", &rev_str])?
            .parse::<i64>()
            .ok();

        let dest = self.cache_dir.join(&rev_str);
        if dest.is_dir() {
            debug!(path = %dest.display(), "using cached export");
        } else {
            Self::export(input, &repo, &rev, &dest)?;
        }

        let mut info = source_info(input, &dest)?;
        info.rev = Some(rev);
        info.rev_count = rev_count;
        info.last_modified = last_modified;

        let locked = FlakeRef::Git {
            url: url.clone(),
            git_ref: git_ref.clone(),
            rev: Some(rev),
        };

        Ok((
            Tree {
                actual_path: dest,
                info,
            },
            locked,
        ))
    }

    #[instrument(skip(self), fields(input = %input), err)]
    fn clone_to(&self, input: &FlakeRef, dest: &Path) -> Result<(), Error> {
        let (url, git_ref) = match input {
            FlakeRef::Git { url, git_ref, .. } => (url.to_string(), git_ref.clone()),
            FlakeRef::GitHub {
                owner,
                repo,
                git_ref,
                ..
            } => (format!("https://github.com/{owner}/{repo}.git"), git_ref.clone()),
            _ => return Err(Error::Unsupported(input.clone())),
        };

        let mut cmd = Command::new("git");
        cmd.arg("clone");
        if let Some(git_ref) = &git_ref {
            cmd.args(["--branch", git_ref]);
        }
        cmd.arg(&url).arg(dest);
        Self::run(input, &mut cmd)?;

        if let Some(rev) = input.rev() {
            Self::git(input, dest, &["checkout", "--quiet", &rev.to_string()])?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, process::Command};

    use pretty_assertions::assert_eq;

    use super::GitFetcher;
    use crate::{fetchers::Fetcher, flakeref::FlakeRef};

    fn git(dir: &Path, args: &[&str]) -> bool {
        Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.org")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.org")
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Creates a repository with two commits, or returns None if git is
    /// not available.
    fn repo(dir: &Path) -> Option<()> {
        if !git(dir, &["init", "--quiet"]) {
            return None;
        }
        fs::write(dir.join("flake.json"), "{}").unwrap();
        git(dir, &["add", "."]).then_some(())?;
        git(dir, &["commit", "--quiet", "-m", "one"]).then_some(())?;
        fs::write(dir.join("README"), "hello").unwrap();
        git(dir, &["add", "."]).then_some(())?;
        git(dir, &["commit", "--quiet", "-m", "two"]).then_some(())
    }

    #[test]
    fn fetch_pins_revision() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        if repo(src.path()).is_none() {
            eprintln!("git not available, skipping");
            return;
        }

        let input: FlakeRef = format!("git+file://{}", src.path().display())
            .parse()
            .unwrap();
        let fetcher = GitFetcher::new(cache.path().to_path_buf());
        let (tree, locked) = fetcher.fetch(&input).expect("fetch must succeed");

        assert_eq!(Some(2), tree.info.rev_count);
        assert!(tree.info.rev.is_some());
        assert_eq!(tree.info.rev.as_ref(), locked.rev());
        assert_eq!("hello", fs::read_to_string(tree.actual_path.join("README")).unwrap());
        assert!(!tree.actual_path.join(".git").exists());

        // fetching the locked reference again hits the cache and yields
        // the same tree.
        let (again, _) = fetcher.fetch(&locked).expect("fetch must succeed");
        assert_eq!(tree, again);
    }
}
