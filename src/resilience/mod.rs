//! Cross-cutting resilience primitives used by every external call site and
//! by the Market Coordinator's deferred work: a circuit breaker registry,
//! an SLO compliance monitor, a multi-layer cache, and a priority task
//! queue.

pub mod cache;
pub mod circuit_breaker;
pub mod slo;
pub mod task_queue;

pub use cache::{Cache, CacheBackend, CacheConfig, InProcessBackend};
pub use circuit_breaker::{BreakerRejection, CircuitBreakerConfig, CircuitRegistry, CircuitState};
pub use slo::{SloConfig, SloMonitor};
pub use task_queue::{Priority, QueueStats, RetryPolicy, TaskId, TaskQueue, TaskQueueConfig, TaskStatus};
