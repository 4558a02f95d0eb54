pub mod alignment;
pub mod batch;
pub mod catalog;
pub mod colmap;
pub mod config;
pub mod dataset;
pub mod environment;
pub mod error;
pub mod geo;
pub mod image;
pub mod job;
pub mod merge;
pub mod metadata;
pub mod pipeline;
pub mod pose_index;
pub mod quality;
pub mod selector;
pub mod staging;
pub mod state;

#[cfg(test)]
mod testing;

pub use batch::Batch;
pub use catalog::{GroupCatalog, GroupId};
pub use config::PipelineConfig;
pub use environment::Environment;
pub use error::{Error, Result};
pub use merge::{MergeOutcome, MergeRecord};
pub use pipeline::{AttemptOutcome, Pipeline};
pub use quality::{ReviewDecision, Reviewer, Verdict};
