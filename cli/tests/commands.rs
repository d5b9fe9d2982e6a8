use std::{fs, path::Path};

use clap::Parser;
use expect_test::expect;
use pretty_assertions::assert_eq;
use tvix_flake::{
    fetchers::{Fetcher, PathFetcher},
    flakeref::FlakeRef,
};
use tvix_flake_cli::{run, Args};

const FLAKE_JSON: &str = r#"{
  "description": "a test flake",
  "edition": 201909,
  "outputs": {
    "kind": "attrs",
    "attrs": {
      "checks": {
        "kind": "attrs",
        "attrs": {
          "x86_64-linux": {
            "kind": "attrs",
            "attrs": {
              "test1": {
                "kind": "attrs",
                "attrs": {
                  "type": {"kind": "string", "value": "derivation"},
                  "drvPath": {"kind": "string", "value": "/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-test1.drv"}
                }
              }
            }
          }
        }
      },
      "formatter": {"kind": "null"}
    }
  }
}"#;

const BROKEN_FLAKE_JSON: &str = r#"{
  "edition": 201909,
  "outputs": {
    "kind": "attrs",
    "attrs": {
      "checks": {
        "kind": "attrs",
        "attrs": {
          "x86_64-linux": {
            "kind": "attrs",
            "attrs": {
              "test1": {"kind": "string", "value": "not a derivation"}
            }
          }
        }
      }
    }
  }
}"#;

/// Runs `tvix-flake` with registries inside `dir`, returning whether it
/// succeeded and what it printed, with `dir` replaced by `$DIR`.
fn tvix_flake(dir: &Path, cmd: &[&str]) -> (bool, String) {
    let mut argv = vec![
        "tvix-flake".to_string(),
        "--user-registry".to_string(),
        dir.join("user-registry.json").display().to_string(),
        "--global-registry".to_string(),
        dir.join("global-registry.json").display().to_string(),
        "--system".to_string(),
        "x86_64-linux".to_string(),
        "--store-addr".to_string(),
        "memory://".to_string(),
    ];
    argv.extend(cmd.iter().map(|s| s.to_string()));

    let args = Args::parse_from(argv);
    let mut out = Vec::new();
    let result = run(&args, dir, &mut out);

    let mut out = String::from_utf8(out).expect("output must be utf-8");
    if let Err(e) = &result {
        out.push_str(&format!("error: {e}\n"));
    }
    (
        result.is_ok(),
        out.replace(&dir.display().to_string(), "$DIR"),
    )
}

fn write_flake(dir: &Path, contents: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("flake.json"), contents).unwrap();
}

#[test]
fn add_twice_then_list() {
    let dir = tempfile::tempdir().unwrap();

    assert!(tvix_flake(dir.path(), &["add", "a", "github:org/b"]).0);
    assert!(tvix_flake(dir.path(), &["add", "a", "github:org/c"]).0);

    let (ok, out) = tvix_flake(dir.path(), &["list"]);
    assert!(ok);
    expect![[r#"
        user   flake:a github:org/c
    "#]]
    .assert_eq(&out);
}

#[test]
fn remove_then_list() {
    let dir = tempfile::tempdir().unwrap();

    assert!(tvix_flake(dir.path(), &["add", "a", "github:org/b"]).0);
    assert!(tvix_flake(dir.path(), &["add", "nixpkgs", "github:NixOS/nixpkgs"]).0);
    assert!(tvix_flake(dir.path(), &["--exclusive-lock", "remove", "a"]).0);
    assert!(tvix_flake(dir.path(), &["remove", "a"]).0);

    let (ok, out) = tvix_flake(dir.path(), &["list"]);
    assert!(ok);
    expect![[r#"
        user   flake:nixpkgs github:NixOS/nixpkgs
    "#]]
    .assert_eq(&out);
}

#[test]
fn add_relative_path() {
    let dir = tempfile::tempdir().unwrap();

    assert!(tvix_flake(dir.path(), &["add", "myflake", "./flake"]).0);

    let (ok, out) = tvix_flake(dir.path(), &["list"]);
    assert!(ok);
    expect![[r#"
        user   flake:myflake path:$DIR/flake
    "#]]
    .assert_eq(&out);
}

#[test]
fn list_with_overrides() {
    let dir = tempfile::tempdir().unwrap();
    assert!(tvix_flake(dir.path(), &["add", "nixpkgs", "github:NixOS/nixpkgs"]).0);

    let (ok, out) = tvix_flake(
        dir.path(),
        &["--override-flake", "nixpkgs", "./nixpkgs", "list"],
    );
    assert!(ok);
    expect![[r#"
        flags  flake:nixpkgs path:$DIR/nixpkgs
        user   flake:nixpkgs github:NixOS/nixpkgs
    "#]]
    .assert_eq(&out);

    let (ok, out) = tvix_flake(
        dir.path(),
        &["--no-registries", "--override-flake", "nixpkgs", "./nixpkgs", "list"],
    );
    assert!(ok);
    expect![[r#"
        flags  flake:nixpkgs path:$DIR/nixpkgs
    "#]]
    .assert_eq(&out);
}

#[test]
fn check_json() {
    let dir = tempfile::tempdir().unwrap();
    write_flake(&dir.path().join("flake"), FLAKE_JSON);

    let (ok, out) = tvix_flake(dir.path(), &["check", "--json", "./flake"]);
    assert!(ok, "{out}");
    expect![[r#"
        {
          "drvPaths": [
            "/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-test1.drv"
          ],
          "ok": true,
          "warnings": [
            "unknown flake output 'formatter'"
          ]
        }
    "#]]
    .assert_eq(&out);
}

#[test]
fn check_json_failure() {
    let dir = tempfile::tempdir().unwrap();
    write_flake(&dir.path().join("flake"), BROKEN_FLAKE_JSON);

    let (ok, out) = tvix_flake(dir.path(), &["check", "--json", "--no-build", "./flake"]);
    assert!(!ok);
    expect![[r#"
        {
          "attrPath": "checks.x86_64-linux.test1",
          "error": "while checking flake output 'checks':\nwhile checking the derivation 'checks.x86_64-linux.test1' at $DIR/flake/flake.json:1:1:\nflake attribute 'checks.x86_64-linux.test1' is not a derivation",
          "ok": false
        }
        error: while checking flake output 'checks':
        while checking the derivation 'checks.x86_64-linux.test1' at $DIR/flake/flake.json:1:1:
        flake attribute 'checks.x86_64-linux.test1' is not a derivation
    "#]]
    .assert_eq(&out);
}

#[test]
fn check_through_registry() {
    let dir = tempfile::tempdir().unwrap();
    write_flake(&dir.path().join("flake"), FLAKE_JSON);

    let flake_path = dir.path().join("flake").display().to_string();
    assert!(tvix_flake(dir.path(), &["add", "myflake", &flake_path]).0);

    let (ok, out) = tvix_flake(dir.path(), &["check", "myflake"]);
    assert!(ok, "{out}");
    assert_eq!("", out);
}

#[test]
fn info_json() {
    let dir = tempfile::tempdir().unwrap();
    let flake_dir = dir.path().join("flake");
    write_flake(&flake_dir, FLAKE_JSON);

    let (tree, _) = PathFetcher
        .fetch(&FlakeRef::Path {
            path: flake_dir.clone(),
        })
        .unwrap();

    let (ok, out) = tvix_flake(dir.path(), &["info", "--json", "./flake"]);
    assert!(ok, "{out}");

    let mut info: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert!(info["lastModified"].is_i64());
    info.as_object_mut().unwrap().remove("lastModified");

    let out = serde_json::to_string_pretty(&info)
        .unwrap()
        .replace(&tree.info.store_path.to_absolute_path(), "$SOURCE");
    expect![[r#"
        {
          "description": "a test flake",
          "edition": 201909,
          "outputs": {
            "checks": {
              "x86_64-linux": {}
            },
            "formatter": {}
          },
          "path": "$SOURCE",
          "url": "path:$DIR/flake"
        }"#]]
    .assert_eq(&out);
}

#[test]
fn info_unresolvable() {
    let dir = tempfile::tempdir().unwrap();

    let (ok, out) = tvix_flake(dir.path(), &["info", "foo"]);
    assert!(!ok);
    expect![[r#"
        error: cannot find flake 'flake:foo' in the flake registries
    "#]]
    .assert_eq(&out);
}

#[test]
fn no_registries_disables_user_registry() {
    let dir = tempfile::tempdir().unwrap();
    write_flake(&dir.path().join("flake"), FLAKE_JSON);

    let flake_path = dir.path().join("flake").display().to_string();
    assert!(tvix_flake(dir.path(), &["add", "myflake", &flake_path]).0);

    let (ok, out) = tvix_flake(dir.path(), &["--no-registries", "check", "myflake"]);
    assert!(!ok);
    expect![[r#"
        error: cannot find flake 'flake:myflake' in the flake registries
    "#]]
    .assert_eq(&out);
}

#[test]
fn init() {
    let dir = tempfile::tempdir().unwrap();

    let (ok, out) = tvix_flake(dir.path(), &["init"]);
    assert!(!ok);
    expect![[r#"
        error: the directory '$DIR' is not a Git repository
    "#]]
    .assert_eq(&out);

    fs::create_dir(dir.path().join(".git")).unwrap();
    assert!(tvix_flake(dir.path(), &["init"]).0);
    assert!(dir.path().join("flake.nix").exists());

    let (ok, out) = tvix_flake(dir.path(), &["init"]);
    assert!(!ok);
    expect![[r#"
        error: file '$DIR/flake.nix' already exists
    "#]]
    .assert_eq(&out);
}
