//! Data ingestion module - discover, fetch, extract, load, archive and clean
//! up broadband availability files for one snapshot

pub mod archive;
pub mod catalog;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod parse;
pub mod pipeline;
pub mod schema;
pub mod types;
pub mod utils;
pub mod write;

pub use error::*;
pub use types::*;
