//! Probe station: shared access to hardware debug probes.
//!
//! Clients ask for a debug, flash or print session on a probe attached to
//! the station. The station resolves which wire transport the session may
//! use, takes the probe's exclusive lock, starts the hardware server inside
//! an execution environment, and supervises the session until it ends so
//! the lock is never leaked.

pub mod config;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod finder;
pub mod hw_mode;
pub mod lock;
pub mod session;
pub mod status;
pub mod tracing;
pub mod transport;

pub use dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher, LockOutcome, StopOutcome};
pub use error::{Error, Result};
