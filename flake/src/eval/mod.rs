//! The boundary to the expression evaluator.
//!
//! The validator and the loader only ever see output values through an
//! [Evaluator], which forces them on demand. Values stay owned by the
//! evaluator; forcing hands out a shallow [Forced] view of one level.

use std::{collections::BTreeMap, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetchers::Tree;

pub mod snapshot;

pub use snapshot::SnapshotEvaluator;

/// A position in a source file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pos {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Pos {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Pos {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            return f.write_str("«unknown»");
        }
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("{message}, at {pos}")]
    Throw { message: String, pos: Pos },

    #[error("value is {actual} while {expected} was expected, at {pos}")]
    TypeError {
        expected: &'static str,
        actual: &'static str,
        pos: Pos,
    },

    #[error("attribute '{name}' missing, at {pos}")]
    MissingAttribute { name: String, pos: Pos },

    #[error("unable to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to parse '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// The argument of a function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Formals {
    /// `x: ...`
    Positional(String),
    /// `{ a, b, ... }: ...`
    Pattern {
        names: Vec<String>,
        #[serde(default)]
        ellipsis: bool,
    },
}

/// The shape of a function, as far as it can be seen without calling it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LambdaInfo {
    pub arg: Formals,
    /// Set if the function body is itself a function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<LambdaInfo>>,
}

/// One attribute of a forced attribute set.
#[derive(Clone, Debug, PartialEq)]
pub struct Attr<V> {
    pub name: String,
    pub value: V,
    pub pos: Pos,
}

/// A value forced to weak head normal form.
#[derive(Clone, Debug, PartialEq)]
pub enum Forced<V> {
    /// Attributes, sorted by name.
    Attrs(Vec<Attr<V>>),
    Lambda(LambdaInfo),
    String { value: String, context: Vec<String> },
    /// Any other type, by its name.
    Other(&'static str),
}

impl<V> Forced<V> {
    pub fn type_name(&self) -> &'static str {
        match self {
            Forced::Attrs(_) => "a set",
            Forced::Lambda(_) => "a function",
            Forced::String { .. } => "a string",
            Forced::Other(name) => name,
        }
    }
}

/// What the evaluator makes of a flake's source tree.
#[derive(Clone, Debug, PartialEq)]
pub struct FlakeManifest<V> {
    pub description: Option<String>,
    pub edition: Option<u64>,
    /// Declared inputs, by name, as reference strings.
    pub inputs: BTreeMap<String, String>,
    /// The (unforced) `outputs` attribute.
    pub outputs: V,
    pub outputs_pos: Pos,
}

pub fn find_attr<'a, V>(attrs: &'a [Attr<V>], name: &str) -> Option<&'a Attr<V>> {
    attrs.iter().find(|attr| attr.name == name)
}

pub trait Evaluator {
    type Value: Clone + fmt::Debug;

    /// Forces `value` one level deep. `pos` is where the value is used,
    /// and is reported if forcing fails.
    fn force_value(
        &self,
        value: &Self::Value,
        pos: &Pos,
    ) -> Result<Forced<Self::Value>, EvalError>;

    /// Evaluates the manifest at the root of `tree`, without forcing
    /// its outputs.
    fn eval_flake(&self, tree: &Tree) -> Result<FlakeManifest<Self::Value>, EvalError>;

    fn force_attrs(
        &self,
        value: &Self::Value,
        pos: &Pos,
    ) -> Result<Vec<Attr<Self::Value>>, EvalError> {
        match self.force_value(value, pos)? {
            Forced::Attrs(attrs) => Ok(attrs),
            other => Err(EvalError::TypeError {
                expected: "a set",
                actual: other.type_name(),
                pos: pos.clone(),
            }),
        }
    }

    /// Forces a string, returning it along with its context.
    fn force_string(
        &self,
        value: &Self::Value,
        pos: &Pos,
    ) -> Result<(String, Vec<String>), EvalError> {
        match self.force_value(value, pos)? {
            Forced::String { value, context } => Ok((value, context)),
            other => Err(EvalError::TypeError {
                expected: "a string",
                actual: other.type_name(),
                pos: pos.clone(),
            }),
        }
    }

    /// A derivation is an attribute set whose `type` is `"derivation"`.
    fn is_derivation(&self, value: &Self::Value, pos: &Pos) -> Result<bool, EvalError> {
        let Forced::Attrs(attrs) = self.force_value(value, pos)? else {
            return Ok(false);
        };

        match find_attr(&attrs, "type") {
            Some(attr) => Ok(matches!(
                self.force_value(&attr.value, &attr.pos)?,
                Forced::String { value, .. } if value == "derivation"
            )),
            None => Ok(false),
        }
    }

    /// Selects the attribute at the dotted `attr_path` below `value`.
    fn lookup(
        &self,
        value: &Self::Value,
        attr_path: &str,
        pos: &Pos,
    ) -> Result<(Self::Value, Pos), EvalError> {
        let mut current = (value.clone(), pos.clone());

        for name in attr_path.split('.').filter(|name| !name.is_empty()) {
            let attrs = self.force_attrs(&current.0, &current.1)?;
            let attr = find_attr(&attrs, name).ok_or_else(|| EvalError::MissingAttribute {
                name: name.to_string(),
                pos: current.1.clone(),
            })?;
            current = (attr.value.clone(), attr.pos.clone());
        }

        Ok(current)
    }
}

impl<E: Evaluator + ?Sized> Evaluator for &E {
    type Value = E::Value;

    fn force_value(
        &self,
        value: &Self::Value,
        pos: &Pos,
    ) -> Result<Forced<Self::Value>, EvalError> {
        (**self).force_value(value, pos)
    }

    fn eval_flake(&self, tree: &Tree) -> Result<FlakeManifest<Self::Value>, EvalError> {
        (**self).eval_flake(tree)
    }
}
