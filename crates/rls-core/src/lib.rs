pub mod arc;
pub mod signal;
pub mod telemetry;
pub mod version;

pub use arc::{Atomic, AtomicOption};
