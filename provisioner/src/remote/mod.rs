//! Remote command execution

pub mod session;
pub mod ssh;
pub mod stream;
