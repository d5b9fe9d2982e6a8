use std::path::PathBuf;

use tracing::debug;

use crate::{
    errors::Result,
    flakeref::FlakeRef,
    lockfile::LockFileMode,
    registry::{Registry, RegistryKind},
    resolve::Registries,
    systems,
};

pub const DEFAULT_GLOBAL_REGISTRY: &str = "/etc/nix/registry.json";
pub const DEFAULT_STORE_ADDR: &str = "dummy://";

/// `$XDG_CONFIG_HOME/nix/registry.json`, or a path relative to the
/// working directory if there is no configuration directory.
pub fn default_user_registry() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("nix")
        .join("registry.json")
}

/// Everything that can be configured about an invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub user_registry: PathBuf,
    pub global_registry: PathBuf,
    /// `from -> to` pairs forming the flag registry.
    pub flag_overrides: Vec<(FlakeRef, FlakeRef)>,
    /// Whether the user and global registries are consulted.
    pub use_registries: bool,
    /// The system whose checks get built.
    pub system: String,
    pub store_addr: String,
    /// Hold an exclusive lock on the user registry while mutating it.
    pub exclusive_lock: bool,
    pub lock_file_mode: LockFileMode,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            user_registry: default_user_registry(),
            global_registry: DEFAULT_GLOBAL_REGISTRY.into(),
            flag_overrides: Vec::new(),
            use_registries: true,
            system: systems::current_system(),
            store_addr: DEFAULT_STORE_ADDR.to_string(),
            exclusive_lock: false,
            lock_file_mode: LockFileMode::default(),
        }
    }
}

impl Settings {
    pub fn flag_registry(&self) -> Registry {
        let mut registry = Registry::new(RegistryKind::Flag);
        for (from, to) in &self.flag_overrides {
            registry.add(from.clone(), to.clone());
        }
        registry
    }

    pub fn user_registry(&self) -> Result<Registry> {
        Ok(Registry::read(&self.user_registry, RegistryKind::User)?)
    }

    pub fn global_registry(&self) -> Result<Registry> {
        Ok(Registry::read(&self.global_registry, RegistryKind::Global)?)
    }

    /// The full registry chain. The flag registry is always part of it,
    /// the ones on disk only if registries are enabled.
    pub fn registries(&self) -> Result<Registries> {
        if !self.use_registries {
            debug!("registries disabled, only using flag overrides");
            return Ok(Registries::new(vec![self.flag_registry()]));
        }
        self.registries_with_user(self.user_registry()?)
    }

    /// Like [Settings::registries], with `user` in place of the user
    /// registry on disk.
    pub fn registries_with_user(&self, user: Registry) -> Result<Registries> {
        let mut registries = vec![self.flag_registry()];
        if self.use_registries {
            registries.push(user);
            registries.push(self.global_registry()?);
        }
        Ok(Registries::new(registries))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Settings;
    use crate::registry::{Registry, RegistryKind};

    #[test]
    fn no_registries_keeps_flags() {
        let dir = tempfile::tempdir().unwrap();
        let user_registry = dir.path().join("user.json");

        let mut user = Registry::new(RegistryKind::User);
        user.add("a".parse().unwrap(), "github:org/a".parse().unwrap());
        user.write(&user_registry).unwrap();

        let mut settings = Settings {
            user_registry,
            global_registry: dir.path().join("global.json"),
            flag_overrides: vec![("b".parse().unwrap(), "path:/src/b".parse().unwrap())],
            ..Default::default()
        };

        let kinds = |settings: &Settings| {
            settings
                .registries()
                .unwrap()
                .iter()
                .filter(|r| !r.entries().is_empty())
                .map(|r| r.kind())
                .collect::<Vec<_>>()
        };

        assert_eq!(vec![RegistryKind::Flag, RegistryKind::User], kinds(&settings));

        settings.use_registries = false;
        assert_eq!(vec![RegistryKind::Flag], kinds(&settings));
    }

    #[test]
    fn broken_user_registry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let user_registry = dir.path().join("user.json");
        std::fs::write(&user_registry, "not json").unwrap();

        let settings = Settings {
            user_registry,
            global_registry: dir.path().join("global.json"),
            ..Default::default()
        };
        assert!(settings.registries().is_err());
    }
}
