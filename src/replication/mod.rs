//! Trade replication engine.

mod approval;
mod circuit_breaker;
mod config;
mod controller;
mod executor;
mod margin;
mod reporter;
mod scaling;

pub use approval::ApprovalGate;
pub use circuit_breaker::{CircuitBreaker, TripReason};
pub use config::{ConfigUpdate, ControllerSettings, ReplicationConfig, ScalingMode};
pub use controller::{ReplicationController, ReplicationDeps, ReplicationHandle, ReplicationState};
pub use executor::ExecutionAdapter;
pub use margin::{has_sufficient_margin, required_margin, MIN_TRADE_SIZE};
pub use reporter::{CheckStatus, Reporter, StatusLine};
pub use scaling::ScalingPolicy;
