//! An [Evaluator] over output trees that were evaluated ahead of time and
//! recorded as JSON.
//!
//! A source tree carries its snapshot in `flake.json` at its root:
//!
//! ```json
//! {
//!   "description": "a flake",
//!   "edition": 201909,
//!   "inputs": { "nixpkgs": "nixpkgs" },
//!   "outputs": { "kind": "attrs", "attrs": { ... } }
//! }
//! ```
//!
//! Every value is tagged with its `kind`. `throw` values fail when they
//! are forced, which is how evaluation errors are recorded.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{Attr, EvalError, Evaluator, FlakeManifest, Forced, Formals, LambdaInfo, Pos};
use crate::fetchers::Tree;

pub const SNAPSHOT_FILE: &str = "flake.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool {
        value: bool,
    },
    Int {
        value: i64,
    },
    Float {
        value: f64,
    },
    String {
        value: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        context: Vec<String>,
    },
    Path {
        value: String,
    },
    List {
        items: Vec<Value>,
    },
    Attrs {
        attrs: BTreeMap<String, Value>,
        /// Where each attribute is defined. Attributes without a recorded
        /// position inherit the one of the set.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        positions: BTreeMap<String, Pos>,
    },
    Lambda(LambdaInfo),
    Throw {
        message: String,
    },
}

impl Value {
    pub fn string(value: impl Into<String>) -> Self {
        Value::String {
            value: value.into(),
            context: Vec::new(),
        }
    }

    pub fn string_with_context<I, S>(value: impl Into<String>, context: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::String {
            value: value.into(),
            context: context.into_iter().map(Into::into).collect(),
        }
    }

    pub fn attrs<I, K>(attrs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Attrs {
            attrs: attrs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            positions: BTreeMap::new(),
        }
    }

    /// A minimal derivation: `{ type = "derivation"; drvPath = ...; }`.
    pub fn derivation(drv_path: &str) -> Self {
        Value::attrs([
            ("type", Value::string("derivation")),
            (
                "drvPath",
                Value::string_with_context(drv_path, [format!("={drv_path}")]),
            ),
        ])
    }

    pub fn lambda(arg: Formals) -> Self {
        Value::Lambda(LambdaInfo { arg, body: None })
    }

    /// A curried function of positional arguments, e.g. `final: prev: ...`.
    pub fn curried(args: &[&str]) -> Self {
        let info = args.iter().rev().fold(None, |body, arg| {
            Some(Box::new(LambdaInfo {
                arg: Formals::Positional(arg.to_string()),
                body,
            }))
        });

        match info {
            Some(info) => Value::Lambda(*info),
            None => Value::Null,
        }
    }

    pub fn throw(message: impl Into<String>) -> Self {
        Value::Throw {
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
struct SnapshotFile {
    description: Option<String>,
    edition: Option<u64>,
    #[serde(default)]
    inputs: BTreeMap<String, String>,
    outputs: Value,
    #[serde(rename = "outputsPos")]
    outputs_pos: Option<Pos>,
}

/// Reads output snapshots from `flake.json`.
#[derive(Clone, Debug, Default)]
pub struct SnapshotEvaluator;

impl SnapshotEvaluator {
    fn read(path: &Path) -> Result<SnapshotFile, EvalError> {
        let contents = fs::read(path).map_err(|source| EvalError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_slice(&contents).map_err(|source| EvalError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Evaluator for SnapshotEvaluator {
    type Value = Value;

    fn force_value(&self, value: &Value, pos: &Pos) -> Result<Forced<Value>, EvalError> {
        Ok(match value {
            Value::Throw { message } => {
                return Err(EvalError::Throw {
                    message: message.clone(),
                    pos: pos.clone(),
                })
            }
            Value::Attrs { attrs, positions } => Forced::Attrs(
                attrs
                    .iter()
                    .map(|(name, value)| Attr {
                        name: name.clone(),
                        value: value.clone(),
                        pos: positions.get(name).cloned().unwrap_or_else(|| pos.clone()),
                    })
                    .collect(),
            ),
            Value::Lambda(info) => Forced::Lambda(info.clone()),
            Value::String { value, context } => Forced::String {
                value: value.clone(),
                context: context.clone(),
            },
            Value::Null => Forced::Other("null"),
            Value::Bool { .. } => Forced::Other("a Boolean"),
            Value::Int { .. } => Forced::Other("an integer"),
            Value::Float { .. } => Forced::Other("a float"),
            Value::Path { .. } => Forced::Other("a path"),
            Value::List { .. } => Forced::Other("a list"),
        })
    }

    #[instrument(skip_all, fields(tree = %tree.actual_path.display()), err)]
    fn eval_flake(&self, tree: &Tree) -> Result<FlakeManifest<Value>, EvalError> {
        let path = tree.actual_path.join(SNAPSHOT_FILE);
        let file = Self::read(&path)?;
        debug!(inputs = file.inputs.len(), "read output snapshot");

        Ok(FlakeManifest {
            description: file.description,
            edition: file.edition,
            inputs: file.inputs,
            outputs: file.outputs,
            outputs_pos: file
                .outputs_pos
                .unwrap_or_else(|| Pos::new(path.display().to_string(), 1, 1)),
        })
    }
}
