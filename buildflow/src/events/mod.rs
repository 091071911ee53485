//! Event delivery for observability and persistence collaborators.
//!
//! Events flow from the scheduler, supervisor and rollback engine into the
//! [`EventBus`], which fans them out to broadcast subscribers and sinks.

mod bus;
mod sink;

pub use bus::{EventBus, DEFAULT_CHANNEL_CAPACITY};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
