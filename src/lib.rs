//! SMS Broker: consent-gated SMS requests with bounded content moderation.

pub mod api;
pub mod broker;
pub mod config;
pub mod consent;
pub mod error;
pub mod phone;
pub mod pipeline;
pub mod requests;
pub mod store;
