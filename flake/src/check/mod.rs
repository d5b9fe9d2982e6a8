//! Validation of the outputs a flake exposes.
//!
//! Outputs are checked category by category. Each category has a fixed
//! schema (see [OutputCategory]); the first violation aborts the whole
//! pass. Errors escaping a nested check are wrapped in a [Frame] per
//! nesting level, so the final [CheckError] reads like a backtrace from
//! the output category down to the offending attribute.

use std::fmt;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{
    eval::{find_attr, EvalError, Evaluator, Forced, Formals, Pos},
    store_path::{self, StorePath},
    systems,
};


/// The output categories with a known schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputCategory {
    /// `<system>.<name>` derivations, built for the current system.
    Checks,
    /// `<system>.<name>` derivations.
    Packages,
    /// `<system>.<name>` apps.
    Apps,
    /// `<system>` derivation.
    DefaultPackage,
    /// `<system>` derivation.
    DevShell,
    /// `<system>` app.
    DefaultApp,
    /// `<system>` of anything.
    LegacyPackages,
    /// `final: prev: ...`
    Overlay,
    /// `<name>` overlays.
    Overlays,
    /// `{ config, ... }: ...` or an attribute set.
    NixosModule,
    /// `<name>` modules.
    NixosModules,
    /// `<name>` system configurations.
    NixosConfigurations,
    /// Nested jobsets with derivations as leaves.
    HydraJobs,
}

const CATEGORIES: &[(&str, OutputCategory)] = &[
    ("checks", OutputCategory::Checks),
    ("packages", OutputCategory::Packages),
    ("apps", OutputCategory::Apps),
    ("defaultPackage", OutputCategory::DefaultPackage),
    ("devShell", OutputCategory::DevShell),
    ("defaultApp", OutputCategory::DefaultApp),
    ("legacyPackages", OutputCategory::LegacyPackages),
    ("overlay", OutputCategory::Overlay),
    ("overlays", OutputCategory::Overlays),
    ("nixosModule", OutputCategory::NixosModule),
    ("nixosModules", OutputCategory::NixosModules),
    ("nixosConfigurations", OutputCategory::NixosConfigurations),
    ("hydraJobs", OutputCategory::HydraJobs),
];

impl OutputCategory {
    pub fn from_name(name: &str) -> Option<Self> {
        CATEGORIES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, category)| *category)
    }

    pub fn name(self) -> &'static str {
        CATEGORIES
            .iter()
            .find(|(_, category)| *category == self)
            .map(|(n, _)| *n)
            .unwrap_or_default()
    }

    pub fn all() -> impl Iterator<Item = OutputCategory> {
        CATEGORIES.iter().map(|(_, category)| *category)
    }
}

impl fmt::Display for OutputCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What was wrong, at the innermost level.
#[derive(Debug, Error)]
pub enum Violation {
    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("'{system}' is not a valid system type, at {pos}")]
    InvalidSystem { system: String, pos: Pos },

    #[error("flake attribute '{0}' is not a derivation")]
    NotADerivation(String),

    #[error("invalid store path: {0}")]
    InvalidStorePath(#[from] store_path::Error),

    #[error("'drvPath' '{0}' is not a derivation path")]
    NotADrvPath(String),

    #[error("attribute 'type' should be 'app', but is '{0}'")]
    NotAnApp(String),

    #[error("app program '{0}' is not in the Nix store")]
    ProgramNotInStore(String),

    #[error("overlay does not take an argument named '{0}'")]
    OverlayArgument(&'static str),

    #[error("module must match an open attribute set ('{{ config, ... }}')")]
    ModuleNotOpen,

    #[error("module must be a function or an attribute set")]
    ModuleType,

    #[error("jobset should not be a derivation at top-level")]
    JobsetIsDerivation,

    #[error("attribute 'config.system.build.toplevel' is not a derivation")]
    ToplevelNotDerivation,
}

/// The kind of check a [Frame] belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Context {
    Output,
    Derivation,
    App,
    Overlay,
    Module,
    ModuleOption,
    HydraJobset,
    NixosConfiguration,
}

/// One level of the breadcrumb trail of a [CheckError].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub context: Context,
    /// Dotted path from the output category to the checked attribute.
    pub attr_path: String,
    pub pos: Option<Pos>,
}

impl Frame {
    fn new(context: Context, attr_path: &str, pos: &Pos) -> Self {
        Frame {
            context,
            attr_path: attr_path.to_string(),
            pos: Some(pos.clone()),
        }
    }

    fn output(name: &str) -> Self {
        Frame {
            context: Context::Output,
            attr_path: name.to_string(),
            pos: None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.context {
            Context::Output => {
                return write!(f, "while checking flake output '{}'", self.attr_path)
            }
            Context::Derivation => "while checking the derivation",
            Context::App => "while checking the app definition",
            Context::Overlay => "while checking the overlay",
            Context::Module => "while checking the NixOS module",
            Context::ModuleOption => "while evaluating the option",
            Context::HydraJobset => "while checking the Hydra jobset",
            Context::NixosConfiguration => "while checking the NixOS configuration",
        };

        write!(f, "{what} '{}'", self.attr_path)?;
        if let Some(pos) = &self.pos {
            write!(f, " at {pos}")?;
        }
        Ok(())
    }
}

/// A schema violation, with the frames it propagated through. The
/// innermost frame comes first.
#[derive(Debug)]
pub struct CheckError {
    pub violation: Violation,
    pub trace: Vec<Frame>,
}

impl CheckError {
    /// The dotted attribute path of the innermost check that failed.
    pub fn attr_path(&self) -> Option<&str> {
        self.trace.first().map(|frame| frame.attr_path.as_str())
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in self.trace.iter().rev() {
            writeln!(f, "{frame}:")?;
        }
        write!(f, "{}", self.violation)
    }
}

impl std::error::Error for CheckError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.violation)
    }
}

impl From<Violation> for CheckError {
    fn from(violation: Violation) -> Self {
        CheckError {
            violation,
            trace: Vec::new(),
        }
    }
}

impl From<EvalError> for CheckError {
    fn from(e: EvalError) -> Self {
        Violation::Eval(e).into()
    }
}

impl From<store_path::Error> for CheckError {
    fn from(e: store_path::Error) -> Self {
        Violation::InvalidStorePath(e).into()
    }
}

trait WithFrame<T> {
    fn within(self, frame: impl FnOnce() -> Frame) -> Result<T, CheckError>;
}

impl<T, E: Into<CheckError>> WithFrame<T> for Result<T, E> {
    fn within(self, frame: impl FnOnce() -> Frame) -> Result<T, CheckError> {
        self.map_err(|e| {
            let mut e = e.into();
            e.trace.push(frame());
            e
        })
    }
}

/// The outcome of a successful validation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckResult {
    /// Derivations to build, in discovery order.
    pub drv_paths: Vec<StorePath>,
    /// Attribute paths of all jobs found in `hydraJobs`.
    pub hydra_jobs: Vec<String>,
    /// Non-fatal findings, such as unknown output categories.
    pub warnings: Vec<String>,
}

/// Validates all `outputs` of a flake, for `system` as the current
/// system.
#[instrument(skip(evaluator, outputs), err)]
pub fn check_outputs<E: Evaluator>(
    evaluator: &E,
    outputs: &E::Value,
    pos: &Pos,
    system: &str,
) -> Result<CheckResult, CheckError> {
    let mut checker = Checker {
        eval: evaluator,
        system,
        result: CheckResult::default(),
    };

    for attr in evaluator.force_attrs(outputs, pos)? {
        match OutputCategory::from_name(&attr.name) {
            Some(category) => {
                debug!(output = %attr.name, "checking flake output");
                let name = attr.name.as_str();
                checker
                    .check_output(category, &attr.value, &attr.pos)
                    .within(|| Frame::output(name))?;
            }
            None => {
                warn!(output = %attr.name, "unknown flake output");
                checker
                    .result
                    .warnings
                    .push(format!("unknown flake output '{}'", attr.name));
            }
        }
    }

    Ok(checker.result)
}

struct Checker<'a, E: Evaluator> {
    eval: &'a E,
    system: &'a str,
    result: CheckResult,
}

type Value<E> = <E as Evaluator>::Value;

impl<E: Evaluator> Checker<'_, E> {
    fn check_output(
        &mut self,
        category: OutputCategory,
        v: &Value<E>,
        pos: &Pos,
    ) -> Result<(), CheckError> {
        let name = category.name();
        self.eval.force_value(v, pos)?;

        match category {
            OutputCategory::Checks | OutputCategory::Packages => {
                self.for_each_system(v, pos, |this, system, v, pos| {
                    for attr in this.eval.force_attrs(v, pos)? {
                        let attr_path = format!("{name}.{system}.{}", attr.name);
                        let drv_path = this.check_derivation(&attr_path, &attr.value, &attr.pos)?;
                        if category == OutputCategory::Checks && system == this.system {
                            this.result.drv_paths.push(drv_path);
                        }
                    }
                    Ok(())
                })?;
            }

            OutputCategory::Apps => {
                self.for_each_system(v, pos, |this, system, v, pos| {
                    for attr in this.eval.force_attrs(v, pos)? {
                        let attr_path = format!("{name}.{system}.{}", attr.name);
                        let drv_paths = this.check_app(&attr_path, &attr.value, &attr.pos)?;
                        this.result.drv_paths.extend(drv_paths);
                    }
                    Ok(())
                })?;
            }

            OutputCategory::DefaultPackage | OutputCategory::DevShell => {
                self.for_each_system(v, pos, |this, system, v, pos| {
                    this.check_derivation(&format!("{name}.{system}"), v, pos)?;
                    Ok(())
                })?;
            }

            OutputCategory::DefaultApp => {
                self.for_each_system(v, pos, |this, system, v, pos| {
                    let drv_paths = this.check_app(&format!("{name}.{system}"), v, pos)?;
                    this.result.drv_paths.extend(drv_paths);
                    Ok(())
                })?;
            }

            OutputCategory::LegacyPackages => {
                self.for_each_system(v, pos, |_, _, _, _| Ok(()))?;
            }

            OutputCategory::Overlay => self.check_overlay(name, v, pos)?,

            OutputCategory::Overlays => {
                for attr in self.eval.force_attrs(v, pos)? {
                    let attr_path = format!("{name}.{}", attr.name);
                    self.check_overlay(&attr_path, &attr.value, &attr.pos)?;
                }
            }

            OutputCategory::NixosModule => self.check_module(name, v, pos)?,

            OutputCategory::NixosModules => {
                for attr in self.eval.force_attrs(v, pos)? {
                    let attr_path = format!("{name}.{}", attr.name);
                    self.check_module(&attr_path, &attr.value, &attr.pos)?;
                }
            }

            OutputCategory::NixosConfigurations => {
                for attr in self.eval.force_attrs(v, pos)? {
                    let attr_path = format!("{name}.{}", attr.name);
                    self.check_nixos_configuration(&attr_path, &attr.value, &attr.pos)?;
                }
            }

            OutputCategory::HydraJobs => self.check_hydra_jobs(name, v, pos)?,
        }

        Ok(())
    }

    /// Walks a system-keyed attribute set. Each key is checked right
    /// before `f` descends into its value, so errors surface in walk order.
    fn for_each_system(
        &mut self,
        v: &Value<E>,
        pos: &Pos,
        mut f: impl FnMut(&mut Self, &str, &Value<E>, &Pos) -> Result<(), CheckError>,
    ) -> Result<(), CheckError> {
        for attr in self.eval.force_attrs(v, pos)? {
            if !systems::is_system_name(&attr.name) {
                return Err(Violation::InvalidSystem {
                    system: attr.name,
                    pos: attr.pos,
                }
                .into());
            }
            f(self, &attr.name, &attr.value, &attr.pos)?;
        }
        Ok(())
    }

    fn check_derivation(
        &self,
        attr_path: &str,
        v: &Value<E>,
        pos: &Pos,
    ) -> Result<StorePath, CheckError> {
        let drv_path = || -> Result<StorePath, CheckError> {
            if !self.eval.is_derivation(v, pos)? {
                return Err(Violation::NotADerivation(attr_path.to_string()).into());
            }

            let (drv_path, drv_path_pos) = self.eval.lookup(v, "drvPath", pos)?;
            let (drv_path, _) = self.eval.force_string(&drv_path, &drv_path_pos)?;
            let parsed = StorePath::from_absolute_path(&drv_path)?;
            if !parsed.is_derivation() {
                return Err(Violation::NotADrvPath(drv_path).into());
            }
            Ok(parsed)
        };

        drv_path().within(|| Frame::new(Context::Derivation, attr_path, pos))
    }

    /// Returns the derivations the app's program depends on.
    fn check_app(
        &self,
        attr_path: &str,
        v: &Value<E>,
        pos: &Pos,
    ) -> Result<Vec<StorePath>, CheckError> {
        let drv_paths = || -> Result<Vec<StorePath>, CheckError> {
            let attrs = self.eval.force_attrs(v, pos)?;

            let app_type = match find_attr(&attrs, "type") {
                Some(attr) => self.eval.force_string(&attr.value, &attr.pos)?.0,
                None => {
                    return Err(EvalError::MissingAttribute {
                        name: "type".into(),
                        pos: pos.clone(),
                    }
                    .into())
                }
            };
            if app_type != "app" {
                return Err(Violation::NotAnApp(app_type).into());
            }

            let (program, program_pos) = self.eval.lookup(v, "program", pos)?;
            let (program, context) = self.eval.force_string(&program, &program_pos)?;
            if !program.starts_with(store_path::STORE_DIR_WITH_SLASH) {
                return Err(Violation::ProgramNotInStore(program).into());
            }

            let mut drv_paths = Vec::new();
            for element in &context {
                let (path, output) = decode_context(element);
                let path = StorePath::from_absolute_path(path)?;
                if !output.is_empty() && path.is_derivation() {
                    drv_paths.push(path);
                }
            }
            Ok(drv_paths)
        };

        drv_paths().within(|| Frame::new(Context::App, attr_path, pos))
    }

    fn check_overlay(&self, attr_path: &str, v: &Value<E>, pos: &Pos) -> Result<(), CheckError> {
        let shape = || -> Result<(), CheckError> {
            let info = match self.eval.force_value(v, pos)? {
                Forced::Lambda(info) if info.arg == Formals::Positional("final".into()) => info,
                _ => return Err(Violation::OverlayArgument("final").into()),
            };

            match info.body.as_deref() {
                Some(body) if body.arg == Formals::Positional("prev".into()) => Ok(()),
                _ => Err(Violation::OverlayArgument("prev").into()),
            }
        };

        shape().within(|| Frame::new(Context::Overlay, attr_path, pos))
    }

    fn check_module(&self, attr_path: &str, v: &Value<E>, pos: &Pos) -> Result<(), CheckError> {
        let shape = || -> Result<(), CheckError> {
            match self.eval.force_value(v, pos)? {
                Forced::Lambda(info) => match info.arg {
                    Formals::Pattern { ellipsis: true, .. } => Ok(()),
                    _ => Err(Violation::ModuleNotOpen.into()),
                },
                Forced::Attrs(attrs) => {
                    for attr in attrs {
                        let option_path = format!("{attr_path}.{}", attr.name);
                        self.eval
                            .force_value(&attr.value, &attr.pos)
                            .within(|| {
                                Frame::new(Context::ModuleOption, &option_path, &attr.pos)
                            })?;
                    }
                    Ok(())
                }
                _ => Err(Violation::ModuleType.into()),
            }
        };

        shape().within(|| Frame::new(Context::Module, attr_path, pos))
    }

    fn check_hydra_jobs(
        &mut self,
        attr_path: &str,
        v: &Value<E>,
        pos: &Pos,
    ) -> Result<(), CheckError> {
        let jobset = |this: &mut Self| -> Result<(), CheckError> {
            let attrs = this.eval.force_attrs(v, pos)?;
            if this.eval.is_derivation(v, pos)? {
                return Err(Violation::JobsetIsDerivation.into());
            }

            for attr in attrs {
                let child_path = format!("{attr_path}.{}", attr.name);
                this.eval.force_attrs(&attr.value, &attr.pos)?;
                if this.eval.is_derivation(&attr.value, &attr.pos)? {
                    this.result.hydra_jobs.push(child_path);
                } else {
                    this.check_hydra_jobs(&child_path, &attr.value, &attr.pos)?;
                }
            }
            Ok(())
        };

        jobset(self).within(|| Frame::new(Context::HydraJobset, attr_path, pos))
    }

    fn check_nixos_configuration(
        &self,
        attr_path: &str,
        v: &Value<E>,
        pos: &Pos,
    ) -> Result<(), CheckError> {
        debug!(configuration = attr_path, "checking NixOS configuration");

        let toplevel = || -> Result<(), CheckError> {
            let (toplevel, _) = self.eval.lookup(v, "config.system.build.toplevel", pos)?;
            self.eval.force_attrs(&toplevel, pos)?;
            if !self.eval.is_derivation(&toplevel, pos)? {
                return Err(Violation::ToplevelNotDerivation.into());
            }
            Ok(())
        };

        toplevel().within(|| Frame::new(Context::NixosConfiguration, attr_path, pos))
    }
}

/// Splits a string context element into its store path and output name.
/// Elements of the form `!<output>!<path>` name a derivation output; any
/// other element (a plain path or `=<drv-path>`) has no output name.
pub fn decode_context(element: &str) -> (&str, &str) {
    if let Some(rest) = element.strip_prefix('!') {
        if let Some((output, path)) = rest.split_once('!') {
            return (path, output);
        }
    }

    (element.strip_prefix('=').unwrap_or(element), "")
}
