//! Process drivers and format seams: configuration parameter resolution,
//! the reader/writer traits concrete format codecs implement, and the
//! import/export/query/inspect/transform/concordance/distribution processes
//! built on them.

pub mod concordance;
mod config;
pub mod distribution;
mod error;
pub mod export;
pub mod import;
pub mod inspect;
pub mod probability;
mod reader;
pub mod report;
pub mod transforms;
mod writer;

pub use config::Config;
pub use error::{BlockError, Error, Result};
pub use reader::{read_lines, LineFormat, LineReader, Reader, Readers};
pub use writer::{apply_query_updates, Writer, Writers};
