//! Message-driven workers: call execution, status persistence, and retry
//! delay lanes.
//!
//! Each worker is a blocking fetch loop over one consumer group. Loops end
//! only on cancellation; every other error is logged and the loop continues
//! with the next message. Offsets are committed strictly after the action a
//! message represents has been durably reflected downstream, so a crash
//! mid-message redelivers it.

pub mod call;
pub mod retry;
pub mod status;

pub use call::CallWorker;
pub use retry::RetryWorker;
pub use status::StatusWorker;
