//! Terminal output for the CLI.
//!
//! The pipeline itself only logs; these helpers format what the one-shot
//! commands print: key ids, archived payloads, job tables and replayed
//! messages.

pub mod display;

pub use display::{jobs_table, show_ingested, show_jobs, show_keys, show_published, show_verified};
