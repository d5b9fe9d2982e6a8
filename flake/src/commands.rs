//! The operations exposed by the command line frontend.
//!
//! Registry mutations only ever touch the user registry. They read it,
//! change it and write the whole file back. With
//! [Settings::exclusive_lock] set, an exclusive lock is held for the
//! duration of that sequence, otherwise concurrent mutations race and the
//! last writer wins.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{info, instrument};

use crate::{
    check::{check_outputs, CheckResult},
    errors::{Error, Result},
    eval::Evaluator,
    fetchers::Fetcher,
    flake::Loader,
    flakeref::FlakeRef,
    info::FlakeInfo,
    lockfile::{LockFileMode, LockedFlake},
    registry::{Registry, RegistryLock},
    resolve::{resolve_and_fetch, Registries},
    settings::Settings,
    store::Store,
};

const FLAKE_TEMPLATE: &str = include_str!("flake-template.nix");

fn write_err(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Prints every entry of every registry, in precedence order.
pub fn list<W: Write>(registries: &Registries, out: &mut W) -> Result<()> {
    for registry in registries.iter() {
        for entry in registry.entries() {
            writeln!(
                out,
                "{:<6} {} {}",
                registry.kind().to_string(),
                entry.from,
                entry.to
            )
            .map_err(write_err(Path::new("<stdout>")))?;
        }
    }
    Ok(())
}

/// Recomputes and writes the lock file of the flake at `input`.
pub fn update<F: Fetcher, E: Evaluator>(
    loader: &Loader<F, E>,
    input: &FlakeRef,
    mode: LockFileMode,
) -> Result<LockedFlake<E::Value>> {
    loader.lock_flake(input, mode)
}

/// Describes the flake at `input`. The JSON form also lists its outputs,
/// which requires locking it.
pub fn info<F, E, S>(
    loader: &Loader<F, E>,
    store: &S,
    input: &FlakeRef,
    mode: LockFileMode,
    json: bool,
) -> Result<FlakeInfo>
where
    F: Fetcher,
    E: Evaluator,
    S: Store + ?Sized,
{
    if json {
        let locked = loader.lock_flake(input, mode)?;
        let info = FlakeInfo::new(store, &locked.flake);
        Ok(info.with_outputs(loader.evaluator(), &locked.flake)?)
    } else {
        let flake = loader.get_flake(input)?;
        Ok(FlakeInfo::new(store, &flake))
    }
}

/// Validates the outputs of the flake at `input`. With `build` set, all
/// derivations collected during validation are built in one batch.
#[instrument(skip(loader, store), fields(input = %input), err)]
pub fn check<F, E, S>(
    loader: &Loader<F, E>,
    store: &S,
    input: &FlakeRef,
    mode: LockFileMode,
    system: &str,
    build: bool,
) -> Result<CheckResult>
where
    F: Fetcher,
    E: Evaluator,
    S: Store + ?Sized,
{
    let locked = loader.lock_flake(input, mode)?;

    info!("evaluating flake");
    let flake = &locked.flake;
    let result = check_outputs(
        loader.evaluator(),
        &flake.outputs,
        &flake.outputs_pos,
        system,
    )?;

    if build && !result.drv_paths.is_empty() {
        info!(count = result.drv_paths.len(), "running flake checks");
        store.build(&result.drv_paths)?;
    }

    Ok(result)
}

/// Runs `f` on the user registry and persists the result.
fn mutate_user_registry<T>(
    settings: &Settings,
    f: impl FnOnce(&mut Registry) -> Result<T>,
) -> Result<T> {
    let _lock = settings
        .exclusive_lock
        .then(|| RegistryLock::acquire(&settings.user_registry))
        .transpose()?;

    let mut registry = settings.user_registry()?;
    let ret = f(&mut registry)?;
    registry.write(&settings.user_registry)?;
    Ok(ret)
}

/// Maps `from` to `to` in the user registry, replacing earlier mappings
/// of `from`. Relative paths are resolved against `cwd`.
#[instrument(skip(settings), err)]
pub fn add(settings: &Settings, cwd: &Path, from: &str, to: &str) -> Result<()> {
    let from = FlakeRef::parse(from, Some(cwd))?;
    let to = FlakeRef::parse(to, Some(cwd))?;

    mutate_user_registry(settings, |registry| {
        registry.upsert(from, to);
        Ok(())
    })
}

/// Drops all mappings of `url` from the user registry.
#[instrument(skip(settings), err)]
pub fn remove(settings: &Settings, cwd: &Path, url: &str) -> Result<()> {
    let from = FlakeRef::parse(url, Some(cwd))?;

    mutate_user_registry(settings, |registry| {
        registry.remove(&from);
        Ok(())
    })
}

/// Replaces the mapping of `url` in the user registry by what `url`
/// currently resolves to, locked to the fetched revision.
///
/// The old mapping is dropped before resolving, so pinning again moves
/// the entry to the latest revision.
#[instrument(skip(settings, fetcher), err)]
pub fn pin<F>(settings: &Settings, fetcher: &F, cwd: &Path, url: &str) -> Result<FlakeRef>
where
    F: Fetcher + ?Sized,
{
    let from = FlakeRef::parse(url, Some(cwd))?;

    mutate_user_registry(settings, |registry| {
        registry.remove(&from);
        let registries = settings.registries_with_user(registry.clone())?;
        let resolved = resolve_and_fetch(&registries, fetcher, &from)?;
        info!(from = %from, to = %resolved.locked, "pinned");
        registry.upsert(from, resolved.locked.clone());
        Ok(resolved.locked)
    })
}

/// Creates a skeleton `flake.nix` in `dir`, which must be a git work tree
/// without a `flake.nix` yet.
#[instrument(err)]
pub fn init(dir: &Path) -> Result<PathBuf> {
    if !dir.join(".git").exists() {
        return Err(Error::Init(format!(
            "the directory '{}' is not a Git repository",
            dir.display()
        )));
    }

    let flake_path = dir.join("flake.nix");
    if flake_path.exists() {
        return Err(Error::Init(format!(
            "file '{}' already exists",
            flake_path.display()
        )));
    }

    std::fs::write(&flake_path, FLAKE_TEMPLATE).map_err(write_err(&flake_path))?;
    Ok(flake_path)
}

/// Makes an editable copy of the source of `input` at `dest`.
#[instrument(skip(registries, fetcher), fields(input = %input), err)]
pub fn clone<F: Fetcher + ?Sized>(
    registries: &Registries,
    fetcher: &F,
    input: &FlakeRef,
    dest: &Path,
) -> Result<()> {
    let resolved = registries.resolve(input)?;
    fetcher.clone_to(&resolved, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use super::{add, check, clone, init, list, pin, remove};
    use crate::{
        errors::Error,
        eval::{snapshot::Value, SnapshotEvaluator},
        fetchers::{hash_tree, MemoryFetcher, PathFetcher, SourceInfo, Tree},
        flake::{tests::write_flake, Loader},
        flakeref::{FlakeRef, Rev},
        lockfile::LockFileMode,
        registry::{Registry, RegistryKind},
        resolve::Registries,
        settings::Settings,
        store::MemoryStore,
        store_path::StorePath,
    };

    fn r(s: &str) -> FlakeRef {
        s.parse().expect("valid flake ref")
    }

    fn settings(dir: &Path) -> Settings {
        Settings {
            user_registry: dir.join("user/registry.json"),
            global_registry: dir.join("global/registry.json"),
            system: "x86_64-linux".into(),
            ..Default::default()
        }
    }

    #[test]
    fn add_twice_keeps_last() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        add(&settings, dir.path(), "a", "github:org/b").unwrap();
        add(&settings, dir.path(), "a", "github:org/c").unwrap();

        let mut out = Vec::new();
        list(&settings.registries().unwrap(), &mut out).unwrap();
        assert_eq!(
            "user   flake:a github:org/c\n",
            String::from_utf8(out).unwrap()
        );
    }

    #[test]
    fn add_accepts_direct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.exclusive_lock = true;

        add(&settings, dir.path(), "github:org/a", "github:org/b").unwrap();

        let user = settings.user_registry().unwrap();
        assert_eq!(r("github:org/a"), user.entries()[0].from);
        assert_eq!(r("github:org/b"), user.entries()[0].to);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        add(&settings, dir.path(), "a", "github:org/b").unwrap();
        remove(&settings, dir.path(), "a").unwrap();
        remove(&settings, dir.path(), "a").unwrap();

        assert!(settings.user_registry().unwrap().entries().is_empty());
    }

    #[test]
    fn list_in_precedence_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.flag_overrides = vec![(r("nixpkgs"), r("path:/src/nixpkgs"))];

        let mut global = Registry::new(RegistryKind::Global);
        global.add(r("nixpkgs"), r("github:NixOS/nixpkgs"));
        global.write(&settings.global_registry).unwrap();
        add(&settings, dir.path(), "nixpkgs", "github:me/nixpkgs").unwrap();

        let mut out = Vec::new();
        list(&settings.registries().unwrap(), &mut out).unwrap();
        assert_eq!(
            "flags  flake:nixpkgs path:/src/nixpkgs\n\
             user   flake:nixpkgs github:me/nixpkgs\n\
             global flake:nixpkgs github:NixOS/nixpkgs\n",
            String::from_utf8(out).unwrap()
        );
    }

    #[test]
    fn pin_then_resolve_has_rev() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        let mut global = Registry::new(RegistryKind::Global);
        global.add(r("foo"), r("github:org/foo"));
        global.write(&settings.global_registry).unwrap();

        let rev: Rev = "7ad7dd2b4f4a5f2d3d9f4d7a2e5b6c1a0f9e8d7c".parse().unwrap();
        let mut fetcher = MemoryFetcher::default();
        fetcher.insert(
            r("github:org/foo"),
            Tree {
                actual_path: "/src/foo".into(),
                info: SourceInfo {
                    store_path: StorePath::for_source(&[0; 32], "source").unwrap(),
                    rev: Some(rev),
                    rev_count: Some(1),
                    last_modified: None,
                },
            },
            r(&format!("github:org/foo/{rev}")),
        );

        let pinned = pin(&settings, &fetcher, dir.path(), "foo").unwrap();
        assert_eq!(r(&format!("github:org/foo/{rev}")), pinned);

        let resolved = settings.registries().unwrap().resolve(&r("foo")).unwrap();
        assert_eq!(Some(&rev), resolved.rev());
        assert_eq!(1, settings.user_registry().unwrap().entries().len());
    }

    #[test]
    fn pin_unresolvable() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        assert!(matches!(
            pin(&settings, &MemoryFetcher::default(), dir.path(), "foo"),
            Err(Error::UnresolvableReference(_))
        ));
        assert!(!settings.user_registry.exists());
    }

    fn tree(rev: &Rev) -> Tree {
        Tree {
            actual_path: "/src/foo".into(),
            info: SourceInfo {
                store_path: StorePath::for_source(&[0; 32], "source").unwrap(),
                rev: Some(*rev),
                rev_count: None,
                last_modified: None,
            },
        }
    }

    #[test]
    fn pin_again_moves_to_latest_revision() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        let mut global = Registry::new(RegistryKind::Global);
        global.add(r("foo"), r("github:org/foo"));
        global.write(&settings.global_registry).unwrap();

        let old: Rev = "7ad7dd2b4f4a5f2d3d9f4d7a2e5b6c1a0f9e8d7c".parse().unwrap();
        let new: Rev = "0f4cdc5d2ab7e6c2e8a40c1ea92b3a8e6f1e9a8b".parse().unwrap();
        let old_ref = r(&format!("github:org/foo/{old}"));
        let new_ref = r(&format!("github:org/foo/{new}"));

        let mut before = MemoryFetcher::default();
        before.insert(r("github:org/foo"), tree(&old), old_ref.clone());
        assert_eq!(old_ref, pin(&settings, &before, dir.path(), "foo").unwrap());

        // upstream moved on, while the old revision can still be fetched
        let mut after = MemoryFetcher::default();
        after.insert(old_ref.clone(), tree(&old), old_ref.clone());
        after.insert(r("github:org/foo"), tree(&new), new_ref.clone());
        assert_eq!(new_ref, pin(&settings, &after, dir.path(), "foo").unwrap());

        let user = settings.user_registry().unwrap();
        assert_eq!(1, user.entries().len());
        assert_eq!(new_ref, user.entries()[0].to);
    }

    #[test]
    fn relative_paths_use_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        add(&settings, dir.path(), "foo", "./foo").unwrap();
        let user = settings.user_registry().unwrap();
        assert_eq!(
            FlakeRef::Path {
                path: dir.path().join("foo")
            },
            user.entries()[0].to
        );

        add(&settings, dir.path(), "./bar", "github:org/bar").unwrap();
        remove(&settings, dir.path(), "./bar").unwrap();
        assert_eq!(1, settings.user_registry().unwrap().entries().len());
    }

    #[test]
    fn check_builds_current_system_checks() {
        let dir = tempfile::tempdir().unwrap();
        write_flake(
            dir.path(),
            Some(201909),
            Value::attrs([(
                "checks",
                Value::attrs([
                    (
                        "x86_64-linux",
                        Value::attrs([(
                            "test1",
                            Value::derivation(
                                "/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-test1.drv",
                            ),
                        )]),
                    ),
                    (
                        "aarch64-linux",
                        Value::attrs([(
                            "test1",
                            Value::derivation(
                                "/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-test1-arm.drv",
                            ),
                        )]),
                    ),
                ]),
            )]),
        );

        let loader = Loader::new(Registries::default(), PathFetcher, SnapshotEvaluator);
        let store = MemoryStore::default();
        let input = FlakeRef::Path {
            path: dir.path().to_path_buf(),
        };

        let mode = LockFileMode::ReadOnly;
        check(&loader, &store, &input, mode, "x86_64-linux", false).unwrap();
        assert!(store.builds().is_empty());

        check(&loader, &store, &input, mode, "x86_64-linux", true).unwrap();
        assert_eq!(
            vec![vec![StorePath::from_absolute_path(
                "/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-test1.drv"
            )
            .unwrap()]],
            store.builds()
        );
    }

    #[test]
    fn check_reports_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let drv = "/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-test1.drv";
        write_flake(
            dir.path(),
            Some(201909),
            Value::attrs([(
                "checks",
                Value::attrs([(
                    "x86_64-linux",
                    Value::attrs([("test1", Value::derivation(drv))]),
                )]),
            )]),
        );

        let loader = Loader::new(Registries::default(), PathFetcher, SnapshotEvaluator);
        let store = MemoryStore::default();
        store.fail_on(StorePath::from_absolute_path(drv).unwrap());

        let input = FlakeRef::Path {
            path: dir.path().to_path_buf(),
        };
        assert!(matches!(
            check(&loader, &store, &input, LockFileMode::ReadOnly, "x86_64-linux", true),
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn init_requires_git() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(init(dir.path()), Err(Error::Init(_))));

        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let flake_path = init(dir.path()).expect("init must succeed");
        assert!(std::fs::read_to_string(flake_path)
            .unwrap()
            .contains("edition = 201909;"));

        match init(dir.path()) {
            Err(Error::Init(msg)) => assert!(msg.ends_with("already exists"), "{msg}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn clone_path_flake() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write_flake(&src, Some(201909), Value::attrs::<_, &str>([]));

        let mut registry = Registry::new(RegistryKind::User);
        registry.add(r("foo"), FlakeRef::Path { path: src.clone() });

        let dest = dir.path().join("dest");
        clone(&Registries::new(vec![registry]), &PathFetcher, &r("foo"), &dest).unwrap();

        assert_eq!(hash_tree(&src).unwrap().0, hash_tree(&dest).unwrap().0);
    }
}
