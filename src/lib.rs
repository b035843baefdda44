//! Core ingestion, indexing and recommendation-mining pipeline for a
//! collection-oriented search engine (spec §1).
//!
//! This crate owns the pipeline's logic and data shapes; it does not own
//! durable storage. The document store, inverted index, language analyzer and
//! item-id generator are narrow trait contracts in [`collaborators`] that
//! concrete engines implement out of scope of this crate (spec §6).

pub mod bundle;
pub mod collaborators;
pub mod config;
pub mod directory;
pub mod docid;
pub mod document_preparer;
pub mod error;
pub mod property;
pub mod rebuild;
pub mod recommend;
pub mod scheduler;

pub mod index_worker;
pub mod log_forwarder;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
