//! Scripted recovery

pub mod actions;
pub mod dispatcher;
