//! Pipeline core: reconciliation of the two price sources and the
//! orchestrator that runs whole scrape-and-save flows.

pub mod orchestrator;
pub mod reconciler;

pub use orchestrator::{Orchestrator, RunOutcome};
pub use reconciler::Reconciler;
