//! Agent orchestration for triad: adapters that turn logical agents into
//! concrete CLI invocations, the process supervisor that runs and streams
//! them, the two-phase fan-out/fan-in scheduler, and the job controller
//! façade.

pub mod adapter;
pub mod controller;
pub mod scheduler;
pub mod state_machine;
pub mod supervisor;

pub use controller::JobController;
pub use supervisor::CancelHandle;
