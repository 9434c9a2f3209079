//! The coroutine runtime: tasks, executors, awaiters and alarms.
//!
//! The pieces compose bottom-up. A task's promise control block
//! ([`promise`]) tracks status, cancellation and the parent link. The tag
//! protocol ([`crate::cq`]) parks a suspended task under an opaque word. An
//! executor ([`executor`]) pumps one completion queue and resumes whichever
//! task each tag decodes to. Awaiters ([`awaiter`]) initiate tagged
//! operations, and [`alarm`] is the timer-shaped one.

pub mod alarm;
pub mod awaiter;
pub mod executor;
pub(crate) mod promise;
pub mod task;

pub use promise::TaskStatus;
