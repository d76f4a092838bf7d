//! Inbound event schema
//!
//! This module defines the rows the engine consumes and the boundary through
//! which they are retrieved. How rows are fetched (SQL, API, file) is up to the
//! [`EventSource`] implementation.

mod adapter;
mod event_row;
mod source;

pub use adapter::*;
pub use event_row::*;
pub use source::*;
