use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};
use tracing::Level;
use tvix_flake::{
    flakeref::FlakeRef,
    lockfile::LockFileMode,
    settings::{self, Settings, DEFAULT_GLOBAL_REGISTRY, DEFAULT_STORE_ADDR},
    systems,
};

/// Manages flakes: resolves flake references through the flake
/// registries, locks their inputs and checks their outputs.
///
/// Outputs are read from the `flake.json` snapshot at the root of a
/// flake's source tree.
#[derive(Parser, Clone, Debug)]
#[command(name = "tvix-flake")]
pub struct Args {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, global = true, default_value_t=Level::INFO)]
    pub log_level: Level,

    /// The user registry, the only one that is ever modified.
    /// Defaults to `$XDG_CONFIG_HOME/nix/registry.json`.
    #[arg(long, global = true, env = "TVIX_FLAKE_USER_REGISTRY")]
    pub user_registry: Option<PathBuf>,

    #[arg(long, global = true, env = "TVIX_FLAKE_GLOBAL_REGISTRY", default_value = DEFAULT_GLOBAL_REGISTRY)]
    pub global_registry: PathBuf,

    /// Override a flake registry value for this invocation.
    #[arg(
        long,
        global = true,
        num_args = 2,
        value_names = ["FROM", "TO"],
        action = ArgAction::Append,
    )]
    pub override_flake: Vec<String>,

    /// Only consult registries given with `--override-flake`.
    #[arg(long, global = true)]
    pub no_registries: bool,

    /// The system whose checks are built. Defaults to the host system.
    #[arg(long, global = true, env = "TVIX_FLAKE_SYSTEM")]
    pub system: Option<String>,

    /// The store used for building checks.
    #[arg(long, global = true, env = "TVIX_FLAKE_STORE_ADDR", default_value = DEFAULT_STORE_ADDR)]
    pub store_addr: String,

    /// Hold an exclusive lock on the user registry while modifying it.
    #[arg(long, global = true)]
    pub exclusive_lock: bool,

    /// Ignore an existing lock file and write a fresh one.
    #[arg(long, global = true, conflicts_with = "no_update_lock_file")]
    pub recreate_lock_file: bool,

    /// Never write lock files.
    #[arg(long, global = true)]
    pub no_update_lock_file: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// List available flakes.
    List,

    /// Update the flake lock file.
    Update {
        #[arg(default_value = ".")]
        flake_url: String,
    },

    /// List info about a given flake.
    Info {
        #[arg(default_value = ".")]
        flake_url: String,

        /// Print as JSON, including the list of outputs.
        #[arg(long)]
        json: bool,
    },

    /// Check whether the flake evaluates and run its tests.
    Check {
        #[arg(default_value = ".")]
        flake_url: String,

        /// Do not build checks.
        #[arg(long)]
        no_build: bool,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Upsert a flake in the user flake registry.
    Add { from_url: String, to_url: String },

    /// Remove a flake from the user flake registry.
    Remove { url: String },

    /// Pin a flake to its current version in the user flake registry.
    Pin { url: String },

    /// Create a skeleton 'flake.nix' file in the current directory.
    Init,

    /// Clone a flake repository.
    Clone {
        #[arg(default_value = ".")]
        flake_url: String,

        /// Destination path.
        #[arg(long, short = 'f')]
        dest: PathBuf,
    },
}

impl Args {
    pub fn lock_file_mode(&self) -> LockFileMode {
        if self.recreate_lock_file {
            LockFileMode::Recreate
        } else if self.no_update_lock_file {
            LockFileMode::ReadOnly
        } else {
            LockFileMode::Update
        }
    }

    /// Builds the [Settings] for this invocation. Relative paths in
    /// flag overrides are resolved against `cwd`.
    pub fn settings(&self, cwd: &Path) -> tvix_flake::Result<Settings> {
        let flag_overrides = self
            .override_flake
            .chunks(2)
            .map(|pair| -> tvix_flake::Result<(FlakeRef, FlakeRef)> {
                match pair {
                    [from, to] => Ok((
                        FlakeRef::parse(from, Some(cwd))?,
                        FlakeRef::parse(to, Some(cwd))?,
                    )),
                    // clap guarantees pairs
                    _ => Err(tvix_flake::flakeref::Error::Invalid(pair.join(" ")).into()),
                }
            })
            .collect::<tvix_flake::Result<Vec<_>>>()?;

        Ok(Settings {
            user_registry: self
                .user_registry
                .clone()
                .unwrap_or_else(settings::default_user_registry),
            global_registry: self.global_registry.clone(),
            flag_overrides,
            use_registries: !self.no_registries,
            system: self.system.clone().unwrap_or_else(systems::current_system),
            store_addr: self.store_addr.clone(),
            exclusive_lock: self.exclusive_lock,
            lock_file_mode: self.lock_file_mode(),
        })
    }
}
