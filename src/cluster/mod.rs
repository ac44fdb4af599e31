//! The worker pool: instances, their breakers and health, selection and sizing.

pub mod autoscaler;
pub mod balancer;
pub mod circuit_breaker;
pub mod health;
pub mod instance;

pub use autoscaler::{AutoScaler, LinearTrendForecaster, LoadForecaster, ScalingAction, ScalingDecision};
pub use balancer::{
    AdaptiveScorer, BalancingAlgorithm, InstanceScorer, LoadBalancer, LoadBalancingDecision,
    RouteRequest, RoutingAction,
};
pub use circuit_breaker::{CircuitBreaker, CircuitState, StateChange};
pub use health::{HealthMonitor, HealthProbe, HealthUpdate, HttpProbe, ProbeResult, ProbeTarget, SimulatedProbe};
pub use instance::{InstanceCapacity, InstanceSnapshot, InstanceStatus, WorkerInstance};
