//! Delta events exchanged over the streaming API.
//!
//! Outbound, [`diff`] turns two compiled feature files into the minimal set
//! of update and removal events. Inbound, [`decode_events`] reads a delta
//! message from an upstream stream and [`apply_events`] merges it into a raw
//! snapshot.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Feature, FeatureFile, Overrides, Segment};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    Hydration {
        #[serde(default)]
        event_id: u64,
        #[serde(default)]
        features: Vec<Feature>,
        #[serde(default)]
        segments: Vec<Segment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_features: Option<Vec<Feature>>,
    },
    #[serde(rename_all = "camelCase")]
    FeatureUpdated {
        #[serde(default)]
        event_id: u64,
        feature: Feature,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_feature: Option<Feature>,
    },
    #[serde(rename_all = "camelCase")]
    FeatureRemoved {
        #[serde(default)]
        event_id: u64,
        feature_name: String,
        #[serde(default)]
        project: String,
    },
    #[serde(rename_all = "camelCase")]
    SegmentUpdated {
        #[serde(default)]
        event_id: u64,
        segment: Segment,
    },
    #[serde(rename_all = "camelCase")]
    SegmentRemoved {
        #[serde(default)]
        event_id: u64,
        segment_id: i64,
    },
    /// Override and pause state, only sent to privileged subscribers.
    #[serde(rename_all = "camelCase")]
    HydrationOverleash {
        #[serde(default)]
        event_id: u64,
        #[serde(default)]
        overrides: Overrides,
        #[serde(default)]
        paused: bool,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::Hydration { event_id, .. }
            | Event::FeatureUpdated { event_id, .. }
            | Event::FeatureRemoved { event_id, .. }
            | Event::SegmentUpdated { event_id, .. }
            | Event::SegmentRemoved { event_id, .. }
            | Event::HydrationOverleash { event_id, .. } => *event_id,
        }
    }
}

/// Body of a streamed message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Delta {
    pub events: Vec<Event>,
}

/// Decodes a delta message. Events with an unknown `type` or a malformed
/// body are skipped.
pub fn decode_events(data: &str) -> Result<Vec<Event>, serde_json::Error> {
    #[derive(Deserialize)]
    struct Raw {
        #[serde(default)]
        events: Vec<serde_json::Value>,
    }

    let raw: Raw = serde_json::from_str(data)?;
    let events = raw
        .events
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Event>(value) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "skipping undecodable delta event");
                None
            }
        })
        .collect();
    Ok(events)
}

/// Computes the events that turn `old` into `new`.
///
/// Updates follow the order of `new`, removals the order of `old`.
/// `remote` supplies the pre-override value of each updated feature.
pub fn diff(
    old: &FeatureFile,
    new: &FeatureFile,
    remote: &FeatureFile,
    mut next_id: impl FnMut() -> u64,
) -> Vec<Event> {
    let mut events = Vec::new();

    for feature in &new.features {
        if old.feature(&feature.name) != Some(feature) {
            events.push(Event::FeatureUpdated {
                event_id: next_id(),
                feature: feature.clone(),
                original_feature: remote.feature(&feature.name).cloned(),
            });
        }
    }

    for feature in &old.features {
        if new.feature(&feature.name).is_none() {
            events.push(Event::FeatureRemoved {
                event_id: next_id(),
                feature_name: feature.name.clone(),
                project: feature.project.clone(),
            });
        }
    }

    for segment in &new.segments {
        if old.segment(segment.id) != Some(segment) {
            events.push(Event::SegmentUpdated {
                event_id: next_id(),
                segment: segment.clone(),
            });
        }
    }

    for segment in &old.segments {
        if new.segment(segment.id).is_none() {
            events.push(Event::SegmentRemoved {
                event_id: next_id(),
                segment_id: segment.id,
            });
        }
    }

    events
}

/// Result of merging inbound events into a raw snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    pub file: FeatureFile,
    /// Override and pause state replicated from upstream, if any was carried.
    pub control: Option<(Overrides, bool)>,
}

/// Merges `events` into a copy of `file`.
///
/// Hydration replaces the whole snapshot, preferring the pre-override
/// feature list when present. Control events are honoured on the primary
/// stream only.
pub fn apply_events(file: &FeatureFile, events: Vec<Event>, primary: bool) -> Applied {
    let mut file = file.clone();
    let mut control = None;

    for event in events {
        match event {
            Event::Hydration {
                features,
                segments,
                original_features,
                ..
            } => {
                file.features = original_features.unwrap_or(features);
                file.segments = segments;
            }
            Event::FeatureUpdated {
                feature,
                original_feature,
                ..
            } => {
                let mut feature = original_feature.unwrap_or(feature);
                feature.refresh_search_term();
                match file.features.iter_mut().find(|f| f.name == feature.name) {
                    Some(existing) => *existing = feature,
                    None => file.features.push(feature),
                }
            }
            Event::FeatureRemoved { feature_name, .. } => {
                file.features.retain(|f| f.name != feature_name);
            }
            Event::SegmentUpdated { segment, .. } => {
                match file.segments.iter_mut().find(|s| s.id == segment.id) {
                    Some(existing) => *existing = segment,
                    None => file.segments.push(segment),
                }
            }
            Event::SegmentRemoved { segment_id, .. } => {
                file.segments.retain(|s| s.id != segment_id);
            }
            Event::HydrationOverleash {
                overrides, paused, ..
            } => {
                if primary {
                    control = Some((overrides, paused));
                } else {
                    debug!("ignoring override hydration on a secondary stream");
                }
            }
        }
    }

    for feature in file.features.iter_mut() {
        feature.refresh_search_term();
    }

    Applied { file, control }
}
