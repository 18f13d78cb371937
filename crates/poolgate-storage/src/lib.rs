//! Persistence layer: SeaORM entities, the [`Storage`] trait the engine
//! depends on, and the asynchronous request-log sink.
//!
//! Runtime reads never hit the database; they go through in-memory snapshots
//! owned by the group manager. Storage is for bootstrap, cache reloads, key
//! status persistence, and log appends.

pub mod entities;
mod log_sink;
mod seaorm;
mod storage;

pub use log_sink::{LogEntry, LogSinkConfig, RequestLogSink};
pub use seaorm::SeaOrmStorage;
pub use storage::{
    ApiKeyRow, CatalogSnapshot, GroupInsert, GroupRow, HourlyStatDelta, HubAccessKeyRow,
    InsertKeysOutcome, KeyStatus, NewApiKey, RequestLogInsert, Storage, StorageError,
    StorageResult, SubGroupRow,
};
