//! Evaluation engine seam.
//!
//! Every environment owns one engine instance. The engine receives each
//! compiled feature file as JSON and answers per-context evaluations for the
//! frontend API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{FeatureFile, Payload, Strategy};

/// Context supplied by a frontend client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedToggle {
    pub name: String,
    pub enabled: bool,
    pub variant: EvaluatedVariant,
    pub impression_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedVariant {
    pub name: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(rename = "feature_enabled")]
    pub feature_enabled: bool,
    #[serde(rename = "featureEnabled")]
    pub feature_enabled_camel: bool,
}

impl EvaluatedVariant {
    pub fn disabled(feature_enabled: bool) -> Self {
        Self {
            name: "disabled".to_string(),
            enabled: false,
            payload: None,
            feature_enabled,
            feature_enabled_camel: feature_enabled,
        }
    }
}

pub trait Engine: Send + Sync {
    /// Replaces the engine state with a compiled feature file.
    fn take_state(&mut self, json: &str);

    fn resolve(&self, context: &EvalContext, feature_name: &str) -> Option<EvaluatedToggle>;

    /// Evaluates every feature. Disabled toggles are included only when
    /// `include_all` is set.
    fn resolve_all(&self, context: &EvalContext, include_all: bool) -> Vec<EvaluatedToggle>;
}

/// Context free engine.
///
/// A feature counts as on when it is enabled and either has no strategies
/// or has at least one unconditional strategy: `default`, or a
/// `flexibleRollout` at 100% with no constraints or segments.
#[derive(Debug, Default)]
pub struct StaticEngine {
    state: FeatureFile,
}

impl StaticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn evaluate(feature: &crate::model::Feature) -> EvaluatedToggle {
        let enabled = feature.enabled
            && (feature.strategies.is_empty() || feature.strategies.iter().any(is_unconditional));

        EvaluatedToggle {
            name: feature.name.clone(),
            enabled,
            variant: EvaluatedVariant::disabled(enabled),
            impression_data: feature.impression_data,
        }
    }
}

fn is_unconditional(strategy: &Strategy) -> bool {
    if !strategy.constraints.is_empty() || !strategy.segments.is_empty() {
        return false;
    }
    match strategy.name.as_str() {
        "default" => true,
        "flexibleRollout" | "gradualRolloutRandom" => strategy
            .parameters
            .get("rollout")
            .or_else(|| strategy.parameters.get("percentage"))
            .map(|v| match v {
                serde_json::Value::String(s) => s.trim() == "100",
                serde_json::Value::Number(n) => n.as_f64() == Some(100.0),
                _ => false,
            })
            .unwrap_or(false),
        _ => false,
    }
}

impl Engine for StaticEngine {
    fn take_state(&mut self, json: &str) {
        match serde_json::from_str::<FeatureFile>(json) {
            Ok(state) => self.state = state,
            Err(e) => warn!(error = %e, "engine rejected feature file, keeping previous state"),
        }
    }

    fn resolve(&self, _context: &EvalContext, feature_name: &str) -> Option<EvaluatedToggle> {
        self.state.feature(feature_name).map(Self::evaluate)
    }

    fn resolve_all(&self, _context: &EvalContext, include_all: bool) -> Vec<EvaluatedToggle> {
        self.state
            .features
            .iter()
            .map(Self::evaluate)
            .filter(|t| include_all || t.enabled)
            .collect()
    }
}
