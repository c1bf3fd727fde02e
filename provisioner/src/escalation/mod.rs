pub mod report;
pub mod reporter;
pub mod tracker;
