//! lega-ingest - Ingestion pipeline for a federated genomic archive.
//!
//! Submitters upload OpenPGP-encrypted files to an inbox. For every upload
//! notification the pipeline:
//! - decrypts the session keys of the container header with the service keys
//! - streams the payload once, checking its integrity and hashing the cleartext
//! - stores the payload packet twice, under a header rewrapped for the archive key
//! - re-verifies both copies before announcing the file
//! - tracks each submission through a persisted job state machine
//!
//! Work arrives as JSON messages over a broker; see [`dispatcher`].

pub mod app;
pub mod broker;
pub mod cipher;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod message;
pub mod packet;
pub mod secret;
pub mod settings;
pub mod storage;
pub mod store;
pub mod types;
pub mod ui;

#[cfg(test)]
pub(crate) mod fixtures;
