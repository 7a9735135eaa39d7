//! Background loops for Girder CI/CD.
//!
//! Every API instance runs these independently; all coordination between
//! instances happens through the store's row locks and conditional
//! updates, never in memory.

pub mod reaper;
pub mod scheduler;

pub use reaper::{LostWorkerPolicy, Reaper};
pub use scheduler::Scheduler;
