//! Pure utility functions.
//!
//! These are stateless helpers shared by the supervisor and embedding binaries.

pub mod bootstrap;
pub mod retry;
