//! Loop status exposed to observers outside the acquisition thread.

pub mod log;

pub use log::{
    create_shared_status, create_shared_status_with_persistence, LoopStats, LoopStatus,
    PersistedStats, SharedLoopStatus,
};
