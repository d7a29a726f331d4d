pub mod codec;
pub mod config;
pub mod counters;
pub mod decision;
pub mod error;
pub mod filter;
pub mod grpc;
pub mod hash;
pub mod inflight;
pub mod limits;
pub mod metrics;
pub mod state;
pub mod sync;
pub mod tenant;

pub use state::AppState;
