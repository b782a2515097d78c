//! Invocation contract: what a run is asked to do and what it reports back.
//!
//! Arguments arrive either from CLI flags or from a JSON arguments file in the
//! automation-framework "binary module" layout; results go out as one JSON
//! object with `changed` plus either the label or a failure message and trace.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::core::{AffinityLabel, EngineApi};
use crate::errors::{ErrorContext, LabelError, LabelResult};
use crate::reconciler::{self, Outcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Present,
    Absent,
}

/// Engine connection overrides passed along with a single invocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthParams {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure: Option<bool>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleParams {
    pub name: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub cluster: Option<String>,
    /// `None` leaves VM assignments alone; `Some(vec![])` clears them.
    #[serde(default, deserialize_with = "name_list")]
    pub vms: Option<Vec<String>>,
    #[serde(default, deserialize_with = "name_list")]
    pub hosts: Option<Vec<String>>,
    #[serde(default)]
    pub auth: Option<AuthParams>,
    #[serde(default, rename = "_ansible_check_mode")]
    pub check_mode: bool,
}

// Accepts a list, a comma separated string, or null.
fn name_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::List(names)) => Some(names),
        Some(Raw::Joined(joined)) => Some(
            joined
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        ),
    })
}

impl ModuleParams {
    pub fn from_json(raw: &str) -> LabelResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| LabelError::invalid(format!("unreadable module arguments: {e}")))
    }

    /// Rejects combinations the engine should never see.
    pub fn validate(&self) -> LabelResult<()> {
        if self.name.trim().is_empty() {
            return Err(LabelError::invalid("name must not be empty"));
        }
        if self.state == State::Present && self.cluster.is_none() {
            return Err(LabelError::invalid(
                "state is present but all of the following are missing: cluster",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleResult {
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity_label: Option<AffinityLabel>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl ModuleResult {
    pub fn success(outcome: Outcome) -> Self {
        Self {
            changed: outcome.changed,
            id: outcome.label.as_ref().map(|label| label.id.clone()),
            affinity_label: outcome.label,
            ..Default::default()
        }
    }

    pub fn failure(err: anyhow::Error, context: &ErrorContext) -> Self {
        Self {
            failed: true,
            msg: Some(err.to_string()),
            exception: Some(context.trace(&err)),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"failed": true, "msg": "unable to render result: {e}"}}"#)
        })
    }
}

/// Runs one reconciliation against an open session and always closes it.
pub async fn run_module<E>(engine: &E, params: &ModuleParams, context: &ErrorContext) -> ModuleResult
where
    E: EngineApi + ?Sized,
{
    let result = reconciler::execute(engine, params).await;

    if let Err(e) = engine.close().await {
        warn!(error = %e, "Failed to close engine session");
    }

    match result {
        Ok(outcome) => ModuleResult::success(outcome),
        Err(e) => ModuleResult::failure(anyhow::Error::new(e), context),
    }
}
