// src/recording/mod.rs
//! Record capture and buffered persistence
//!
//! - **Ingest**: host-facing entry points, one per event category
//! - **Event Queue**: lock-free bounded record buffer
//! - **Queue Manager**: background flush worker with retries
//!
//! # Architecture
//!
//! ```text
//! Host event → Recorder → RecordBuilder → RecordQueue → flush worker
//!                                        (non-blocking)       ↓
//!                                                  Batch (flush_batch_size)
//!                                                             ↓
//!                                                 StorageAdapter::write_batch
//! ```

pub mod event_queue;
pub mod ingest;
pub mod queue_manager;

pub use event_queue::{QueueStats, RecordQueue};
pub use ingest::{
    BlockBreakEvent, BlockPlaceEvent, CommandEvent, EntityDeathEvent, EntitySpawnEvent,
    ExplosionEvent, PlayerConnectionEvent, Recorder, SignChangeEvent,
};
pub use queue_manager::{FlushReport, RecordingQueueManager, RecordingStats};
