//! tidemark core library: data model, sync pipeline and shared plumbing used by the
//! source adapters and the binary.

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod o11y;
pub mod sync;

pub use cache::{CacheSettings, LocalCache};
pub use config::{NotionSettings, PropertyNames, SourceConfig, SourceKind, SyncSettings};
pub use error::{Error, FailureClass, Result};
pub use models::{Annotations, CacheEntry, RichTextRun, SyncItem, Title};
pub use sync::commit::{CommitReport, CommitWriter};
pub use sync::cursor::CursorResolver;
pub use sync::engine::{SourceOutcome, SourcePipeline, SourceReport, SyncEngine};
pub use sync::retry::{Dispatcher, FetchReport, FetchState, RetryPolicy};
pub use sync::traits::{CursorMode, Destination, DestinationRecord, SourceAdapter};
