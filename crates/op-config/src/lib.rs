//! Process-wide configuration shared by every object pursuit crate: seeded
//! randomness, tracing setup and layered settings files.

pub mod determinism;
pub mod layered;
pub mod tracing;

pub use layered::{ConfigDiffEvent, ConfigLayer, ConfigLayering, LayeredConfig, LayeredConfigError};
pub use determinism::SeedPolicy;
pub use self::tracing::{InitError, TracingOptions};
