//! mnrun: run compiler and multi-run orchestrator for MikeNet scripts.
//!
//! Expands parameter sweeps into concrete runs, generates a C model source
//! per run, builds and executes the simulator, then archives and packages
//! its output.

pub mod archive;
pub mod cli;
pub mod core;
pub mod journal;
pub mod toolchain;
