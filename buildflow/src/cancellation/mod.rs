//! Cooperative cancellation for builds.

mod token;

pub use token::CancellationToken;
