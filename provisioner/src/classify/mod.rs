//! Failure classification

pub mod engine;
pub mod patterns;
