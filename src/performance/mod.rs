//! Performance primitives shared by the resilience layer: queue depth/wait
//! monitoring and a latency histogram, both reused as-is by
//! `resilience::task_queue` and `resilience::slo` rather than introducing
//! second implementations of either.

pub mod latency;
pub mod queues;
