//! Grade aggregation and promotion engine.
//!
//! Pure functions from already-fetched evaluations, enrollment status and a
//! promotion rule to subject averages, general averages and promotion
//! decisions. Nothing here performs I/O.

pub mod averaging;
pub mod error;
pub mod models;
pub mod promotion;
pub mod rules;

pub use error::GradingError;
