//! Guard components: circuit breaker, rate limiter, kill switches, fault
//! injection, and the orchestrator that sequences them per request.

pub mod circuit_breaker;
pub mod fault_injection;
pub mod kill_switch;
pub mod orchestrator;
pub mod rate_limit;

pub use circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitState};
pub use fault_injection::{
    FaultInjector, FaultParams, FaultPoint, db_timeout_hook, external_5xx_hook, guard_error_hook,
};
pub use kill_switch::{
    DEGRADE_MODE, GLOBAL_IMPORT, KillSwitchManager, SwitchInfo, SwitchState, tenant_switch,
};
pub use orchestrator::{
    Denial, DenyReason, Dependency, EndpointDependencies, GuardOrchestrator, RequestContext,
};
pub use rate_limit::{EndpointClass, RateDecision, RateLimitGuard};
