//! Run archival: SQLite ingestion and tar.gz packaging of run directories.

pub mod database;
pub mod package;
