//! Incident and known-error subsystem

pub mod matcher;
pub mod seed;
pub mod writer;

pub use matcher::KnownErrorMatcher;
pub use writer::IncidentWriter;
