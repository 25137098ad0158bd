//! # Channel Implementations
//!
//! Concrete [`crate::adapter::ChannelAdapter`] implementations.
//!
//! - [`memory`] - In-process simulator with scriptable failures, used by the
//!   daemon's demo mode and by the integration tests.

pub mod memory;
