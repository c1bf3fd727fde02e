pub mod probe;
pub mod verifier;
