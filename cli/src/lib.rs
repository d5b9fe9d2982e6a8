use std::{io::Write, path::Path};

use serde_json::json;
use tracing::instrument;
use tvix_flake::{
    commands,
    eval::SnapshotEvaluator,
    fetchers::DefaultFetcher,
    flake::Loader,
    flakeref::FlakeRef,
    settings::Settings,
    store,
};

pub mod args;
pub mod logging;

pub use args::{Args, Command};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Flake(#[from] tvix_flake::Error),

    #[error("unable to write output: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to serialize output: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tvix_flake::store::Error> for Error {
    fn from(e: tvix_flake::store::Error) -> Self {
        Error::Flake(e.into())
    }
}

fn loader(settings: &Settings) -> tvix_flake::Result<Loader<DefaultFetcher, SnapshotEvaluator>> {
    Ok(Loader::new(
        settings.registries()?,
        DefaultFetcher::default(),
        SnapshotEvaluator,
    ))
}

fn flake_ref(url: &str, cwd: &Path) -> tvix_flake::Result<FlakeRef> {
    Ok(FlakeRef::parse(url, Some(cwd))?)
}

/// Runs the command given in `args`, with `cwd` as the working
/// directory, writing its output to `out`.
#[instrument(skip_all, fields(command = ?args.command), err)]
pub fn run<W: Write>(args: &Args, cwd: &Path, out: &mut W) -> Result<(), Error> {
    let settings = args.settings(cwd)?;

    match &args.command {
        Command::List => commands::list(&settings.registries()?, out)?,

        Command::Update { flake_url } => {
            let locked = commands::update(
                &loader(&settings)?,
                &flake_ref(flake_url, cwd)?,
                settings.lock_file_mode,
            )?;
            if locked.written {
                writeln!(out, "updated lock file of '{}'", locked.flake.locked)?;
            }
        }

        Command::Info { flake_url, json } => {
            let store = store::from_addr(&settings.store_addr)?;
            let info = commands::info(
                &loader(&settings)?,
                &store,
                &flake_ref(flake_url, cwd)?,
                settings.lock_file_mode,
                *json,
            )?;

            if *json {
                serde_json::to_writer(&mut *out, &info)?;
                writeln!(out)?;
            } else {
                write!(out, "{info}")?;
            }
        }

        Command::Check {
            flake_url,
            no_build,
            json,
        } => {
            let store = store::from_addr(&settings.store_addr)?;
            let result = commands::check(
                &loader(&settings)?,
                &store,
                &flake_ref(flake_url, cwd)?,
                settings.lock_file_mode,
                &settings.system,
                !no_build,
            );

            if *json {
                let report = match &result {
                    Ok(result) => json!({
                        "ok": true,
                        "drvPaths": result
                            .drv_paths
                            .iter()
                            .map(|p| store.print_path(p))
                            .collect::<Vec<_>>(),
                        "warnings": result.warnings,
                    }),
                    Err(e) => json!({
                        "ok": false,
                        "error": e.to_string(),
                        "attrPath": match e {
                            tvix_flake::Error::Check(e) => e.attr_path(),
                            _ => None,
                        },
                    }),
                };
                serde_json::to_writer_pretty(&mut *out, &report)?;
                writeln!(out)?;
            }

            result?;
        }

        Command::Add { from_url, to_url } => commands::add(&settings, cwd, from_url, to_url)?,

        Command::Remove { url } => commands::remove(&settings, cwd, url)?,

        Command::Pin { url } => {
            commands::pin(&settings, &DefaultFetcher::default(), cwd, url)?;
        }

        Command::Init => {
            commands::init(cwd)?;
        }

        Command::Clone { flake_url, dest } => commands::clone(
            &settings.registries()?,
            &DefaultFetcher::default(),
            &flake_ref(flake_url, cwd)?,
            dest,
        )?,
    }

    Ok(())
}
