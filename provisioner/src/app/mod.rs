//! Process entry wiring

pub mod options;
pub mod run;
