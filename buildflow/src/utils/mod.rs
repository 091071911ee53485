//! Utility functions for timestamps and build identities.

mod ids;
pub mod timestamps;

pub use ids::{config_fingerprint, generate_build_id};
pub use timestamps::{iso_timestamp, now_utc, Timestamp};
