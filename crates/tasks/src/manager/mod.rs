//! Task manager -- owns the waiting/running pools and drives cycles.
//!
//! Split into focused submodules:
//! - `core`: TaskManager struct, pools, registration, and accessor methods
//! - `cycle`: promotion, per-cycle execution, and teardown
//! - `driver`: threaded and blocking run loops

mod core;
mod cycle;
mod driver;

pub(crate) use self::core::ManagerInner;
pub use self::core::{Deferred, TaskManager};
pub use self::driver::LoopHandle;
