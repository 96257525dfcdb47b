//! Controller runtime.

mod controller;
mod queue;

pub use controller::{Action, Controller, Reconciler};
pub use queue::{backoff_delay, WorkQueue};
