//! SMS requests: records, lifecycle and consent cascades.

pub mod cascade;
pub mod lifecycle;
pub mod model;

pub use cascade::CascadeReconciler;
pub use lifecycle::RequestLifecycle;
pub use model::{RequestStatus, SmsRequest};
