//! Per-number consent: opt-in records and the ledger that owns them.

pub mod ledger;
pub mod model;

pub use ledger::{ConsentLedger, ToggleOutcome};
pub use model::{OptIn, OptInStatus};
