/// Storage module
///
/// Owns the SQLite connection pool shared by the workflow, run, usage and job
/// queue collaborators, and bootstraps their schema.

pub mod database;

pub use database::Database;
