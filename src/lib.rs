//! BuildGuard Library
//!
//! Secure command execution and input validation for build automation:
//! pattern validators for untrusted input, an environment filter that keeps
//! credentials away from child processes, a transient-failure classifier
//! with exponential backoff, and a secure executor tying them together.

pub mod config;
pub mod exec;
