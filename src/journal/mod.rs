//! Journal: append-only JSONL run events and BLAKE3 source hashes.

pub mod eventlog;
pub mod hasher;
