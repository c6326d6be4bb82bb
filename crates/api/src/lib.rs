//! Typed inbound/outbound facade over the ontology engine.
//!
//! `oms-api` is the thin layer a gateway process links against: one
//! method per inbound operation, plus CloudEvents envelope encode/decode
//! for the outbound side. It adds no behavior beyond translating
//! gateway-shaped inputs into [`oms_engine::Ontology`] calls.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod events;
pub mod facade;

pub use events::{decode, encode};
pub use facade::{DeltaRequest, DeltaResponse, OmsApi};
