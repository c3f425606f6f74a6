//! Upstream source adapters and the Notion destination for tidemark.

pub mod connectors;
pub mod http;
pub mod notion;
pub mod registry;

pub use notion::NotionDestination;
pub use registry::{build_pipeline, build_pipelines};
