//! Caching mirror of an upstream feature-flag service.
//!
//! Overleash fetches feature files from upstream for one or more tokens,
//! layers local overrides on top and serves the result to SDKs, either as a
//! whole file with a content fingerprint or as a stream of delta events.

pub mod compile;
pub mod delta;
pub mod engine;
pub mod environment;
pub mod error;
pub mod metrics;
pub mod model;
pub mod overleash;
pub mod storage;
pub mod streamer;
pub mod token;
pub mod upstream;

pub use engine::{Engine, EvalContext, EvaluatedToggle, StaticEngine};
pub use error::{CompileError, OverleashError, StoreError, UpstreamError};
pub use model::{Constraint, Feature, FeatureFile, Override, OverrideConstraint, Overrides, Segment, Strategy};
pub use overleash::{CachedFeatures, Overleash, OverleashConfig, Subscription};
pub use storage::{BroadcastStore, EventStore, Store};
pub use upstream::Upstream;
