//! Wire model of an upstream feature file and of local overrides.
//!
//! Field names follow the upstream client API (camelCase). Collections that
//! the upstream sometimes sends as `null` decode to empty values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Decodes a missing or `null` value as `T::default()`.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The full flag configuration served to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureFile {
    #[serde(default)]
    pub version: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub features: Vec<Feature>,
    #[serde(default, deserialize_with = "nullable")]
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,
}

impl FeatureFile {
    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn segment(&self, id: i64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "nullable")]
    pub feature_type: String,
    #[serde(default, deserialize_with = "nullable")]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub project: String,
    #[serde(default, deserialize_with = "nullable")]
    pub strategies: Vec<Strategy>,
    #[serde(default, deserialize_with = "nullable")]
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<Dependency>>,
    #[serde(default)]
    pub impression_data: bool,
    /// Lower-cased name and description, used by local lookups only.
    #[serde(skip)]
    pub search_term: String,
}

impl Feature {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        let mut feature = Self {
            name: name.into(),
            enabled,
            ..Default::default()
        };
        feature.refresh_search_term();
        feature
    }

    pub fn refresh_search_term(&mut self) {
        self.search_term = format!("{} {}", self.name, self.description).to_lowercase();
    }
}

// search_term is derived data and never part of equality.
impl PartialEq for Feature {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.feature_type == other.feature_type
            && self.description == other.description
            && self.enabled == other.enabled
            && self.project == other.project
            && self.strategies == other.strategies
            && self.variants == other.variants
            && self.stale == other.stale
            && self.created_at == other.created_at
            && self.last_seen_at == other.last_seen_at
            && self.dependencies == other.dependencies
            && self.impression_data == other.impression_data
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub constraints: Vec<Constraint>,
    #[serde(default, deserialize_with = "nullable")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub segments: Vec<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    #[serde(alias = "ContextName")]
    pub context_name: String,
    #[serde(alias = "Operator")]
    pub operator: String,
    #[serde(default, alias = "Values", deserialize_with = "nullable")]
    pub values: Vec<String>,
    #[serde(default, alias = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, alias = "CaseInsensitive")]
    pub case_insensitive: bool,
    #[serde(default, alias = "Inverted")]
    pub inverted: bool,
}

impl Constraint {
    pub fn inverted(&self) -> Self {
        Self {
            inverted: !self.inverted,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub name: String,
    #[serde(default)]
    pub weight: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stickiness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Vec<VariantOverride>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantOverride {
    pub context_name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub feature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<String>>,
}

/// A local override for one feature.
///
/// Earlier releases persisted overrides with PascalCase keys, both spellings
/// decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    #[serde(alias = "FeatureFlag")]
    pub feature_flag: String,
    #[serde(default, alias = "Enabled")]
    pub enabled: bool,
    #[serde(default, alias = "IsGlobal")]
    pub is_global: bool,
    #[serde(default, alias = "Constraints", deserialize_with = "nullable")]
    pub constraints: Vec<OverrideConstraint>,
}

impl Override {
    pub fn global(feature_flag: impl Into<String>, enabled: bool) -> Self {
        Self {
            feature_flag: feature_flag.into(),
            enabled,
            is_global: true,
            constraints: Vec::new(),
        }
    }

    pub fn constrained(feature_flag: impl Into<String>) -> Self {
        Self {
            feature_flag: feature_flag.into(),
            enabled: true,
            is_global: false,
            constraints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideConstraint {
    #[serde(alias = "Enabled")]
    pub enabled: bool,
    #[serde(alias = "Constraint")]
    pub constraint: Constraint,
}

/// Overrides keyed by feature name.
pub type Overrides = BTreeMap<String, Override>;
