//! Human and machine readable reports about a flake.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::{
    check::OutputCategory,
    eval::{EvalError, Evaluator},
    flake::Flake,
    store::Store,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlakeInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub edition: u64,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    pub path: String,
    /// Output names, with the attribute names below `checks` and
    /// `packages`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl FlakeInfo {
    pub fn new<V, S: Store + ?Sized>(store: &S, flake: &Flake<V>) -> Self {
        FlakeInfo {
            description: flake.description.clone(),
            edition: flake.edition,
            url: flake.locked.to_string(),
            revision: flake.source_info.rev.as_ref().map(ToString::to_string),
            rev_count: flake.source_info.rev_count,
            last_modified: flake.source_info.last_modified,
            path: store.print_path(&flake.source_info.store_path),
            outputs: None,
        }
    }

    /// Adds the output listing, which requires evaluating the outputs.
    pub fn with_outputs<E: Evaluator>(
        mut self,
        evaluator: &E,
        flake: &Flake<E::Value>,
    ) -> Result<Self, EvalError> {
        let mut outputs = BTreeMap::new();

        for output in evaluator.force_attrs(&flake.outputs, &flake.outputs_pos)? {
            let mut provides = BTreeMap::new();

            if matches!(
                OutputCategory::from_name(&output.name),
                Some(OutputCategory::Checks | OutputCategory::Packages)
            ) {
                for attr in evaluator.force_attrs(&output.value, &output.pos)? {
                    provides.insert(attr.name, serde_json::Value::Object(Default::default()));
                }
            }

            outputs.insert(output.name, provides);
        }

        self.outputs = Some(outputs);
        Ok(self)
    }
}

fn format_timestamp(secs: i64) -> String {
    match DateTime::from_timestamp(secs, 0) {
        Some(utc) => utc.with_timezone(&Local).format("%F %T").to_string(),
        None => secs.to_string(),
    }
}

impl fmt::Display for FlakeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "URL:           {}", self.url)?;
        writeln!(f, "Edition:       {}", self.edition)?;
        if let Some(description) = &self.description {
            writeln!(f, "Description:   {description}")?;
        }
        writeln!(f, "Path:          {}", self.path)?;
        if let Some(revision) = &self.revision {
            writeln!(f, "Revision:      {revision}")?;
        }
        if let Some(rev_count) = self.rev_count {
            writeln!(f, "Revisions:     {rev_count}")?;
        }
        if let Some(last_modified) = self.last_modified {
            writeln!(f, "Last modified: {}", format_timestamp(last_modified))?;
        }
        Ok(())
    }
}
