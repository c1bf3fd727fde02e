//! Provisioner Library
//!
//! Core modules for provisioning application hosts over SSH.

pub mod app;
pub mod classify;
pub mod errors;
pub mod escalation;
pub mod filesys;
pub mod journal;
pub mod logs;
pub mod models;
pub mod pipeline;
pub mod recovery;
pub mod remote;
pub mod storage;
pub mod utils;
pub mod verify;
