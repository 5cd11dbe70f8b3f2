//! Domain models for the backlog miner.
//!
//! Canonical definitions for the core entities:
//! - `Atom`: one unit of extracted evidence
//! - `RawTicket`: a mined, possibly merged and labeled ticket
//! - `LabelPayload`: a normalized labeler vote
//! - `BacklogError`: the error taxonomy shared by every stage

pub mod atom;
pub mod digest;
pub mod error;
pub mod label;
pub mod ticket;

// Re-export main types and errors
pub use atom::{parse_atoms, read_atoms, Atom, AtomCatalog, Severity, SourceKind};
pub use error::{BacklogError, Result};
pub use label::{
    consensus_label, normalize_label, ChangeSurface, ChangeSurfaceKind, Component, IntentRisk,
    LabelPayload, LABELER_VARIANTS,
};
pub use ticket::{
    dedupe_by_anchor, merge_two_tickets, parse_ticket_list, ticket_anchor, ticket_fingerprint,
    RawTicket, Stage,
};
