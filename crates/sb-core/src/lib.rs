// sb-core: the ingest / fan-out / backpressure engine.
//
// One long-lived actor task owns each sensor's state; everything else talks
// to it through its inbox. The message bus fans measurements out to bounded
// per-subscriber mailboxes; the attention tracker and load monitor publish
// demand and pressure facts on the bus; the backpressure dispatcher reduces
// those two streams into per-connector batching directives.

pub mod actor;
pub mod attention;
pub mod backpressure;
pub mod bus;
pub mod clock;
pub mod collab;
pub mod config;
pub mod error;
pub mod load;
pub mod measurement;
pub mod registry;
pub mod store;
pub mod vocab;

pub use actor::{BatchOutcome, SensorActorHandle, SensorStats};
pub use attention::{AttentionHandle, AttentionSignal};
pub use backpressure::{compute_config, spawn_dispatcher};
pub use bus::{BusEvent, MessageBus, OverflowPolicy, Subscription};
pub use collab::{ColdStorage, JsonlColdStorage, NoopColdStorage, Subject, TokenVerifier};
pub use config::CoreConfig;
pub use error::CoreError;
pub use load::{LoadHandle, LoadState, SystemSampler};
pub use measurement::{Measurement, SensorMeta, SensorSnapshot};
pub use registry::SensorRegistry;
pub use vocab::{AttributeVocabulary, MeasurementField, UpdateAction};
