//! Merges local overrides into an upstream feature file.
//!
//! Compilation is pure: the same remote file, overrides and pause flag always
//! produce byte-identical JSON and therefore the same fingerprint.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::error::CompileError;
use crate::model::{Constraint, Feature, FeatureFile, Override, Overrides, Strategy};

/// Name of the strategy that switches a feature on for everyone.
pub const FORCE_ENABLE_STRATEGY: &str = "default";
/// Name of the strategy synthesized for each enabled override constraint.
pub const CONSTRAINED_ROLLOUT_STRATEGY: &str = "flexibleRollout";

/// A compiled feature file together with its serialized form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Compiled {
    pub file: FeatureFile,
    pub json: String,
    pub etag: String,
}

pub fn force_enable() -> Strategy {
    Strategy {
        name: FORCE_ENABLE_STRATEGY.to_string(),
        ..Default::default()
    }
}

/// Applies `overrides` to a copy of `remote`. While paused the remote file is
/// returned unchanged.
pub fn apply_overrides(remote: &FeatureFile, overrides: &Overrides, paused: bool) -> FeatureFile {
    let mut file = remote.clone();
    if paused {
        return file;
    }

    for o in overrides.values() {
        let Some(feature) = file.features.iter_mut().find(|f| f.name == o.feature_flag) else {
            continue;
        };
        if o.enabled {
            feature.strategies = strategies_for(o, feature);
            feature.enabled = true;
        } else {
            feature.enabled = false;
        }
    }

    file
}

fn strategies_for(o: &Override, feature: &Feature) -> Vec<Strategy> {
    if o.is_global {
        return vec![force_enable()];
    }

    let mut strategies = if feature.enabled {
        feature.strategies.clone()
    } else {
        Vec::new()
    };

    let (enabled, disabled): (Vec<_>, Vec<_>) = o.constraints.iter().partition(|c| c.enabled);
    let disabled: Vec<Constraint> = disabled.iter().map(|c| c.constraint.inverted()).collect();

    if !disabled.is_empty() {
        for strategy in strategies.iter_mut() {
            strategy.constraints.extend(disabled.iter().cloned());
        }
    }

    for c in enabled {
        strategies.push(constrained_rollout(&o.feature_flag, c.constraint.clone()));
    }

    strategies
}

fn constrained_rollout(feature_flag: &str, constraint: Constraint) -> Strategy {
    let parameters = BTreeMap::from([
        ("groupId".to_string(), serde_json::Value::from(feature_flag)),
        ("rollout".to_string(), serde_json::Value::from("100")),
        ("stickiness".to_string(), serde_json::Value::from("default")),
    ]);

    Strategy {
        name: CONSTRAINED_ROLLOUT_STRATEGY.to_string(),
        constraints: vec![constraint],
        parameters,
        segments: Vec::new(),
        variants: Vec::new(),
    }
}

/// Hex encoded SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn compile(
    remote: &FeatureFile,
    overrides: &Overrides,
    paused: bool,
) -> Result<Compiled, CompileError> {
    let file = apply_overrides(remote, overrides, paused);
    let json = serde_json::to_string(&file)?;
    let etag = fingerprint(json.as_bytes());
    Ok(Compiled { file, json, etag })
}
