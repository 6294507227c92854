//! Larch: the log-archive core of a database storage manager.
//!
//! The crate reads a write-ahead log partitioned across numbered files,
//! organizes log records into sorted leveled runs indexed by page, and
//! serves archive scans that merge-read every record for a page range in
//! `(pid, page_version)` order. A node fetch replays such a scan to rebuild
//! a page.
//!
//! ```text
//! partition files -> reader -> ring buffer -> scanner -> consumer
//!                                                           |
//!                                              (run builder, external)
//!                                                           |
//!                      archive runs -> index -> scan -> node fetch -> page
//! ```

#[macro_use]
pub mod error;

pub mod archive;
pub mod config;
pub mod consumer;
pub mod latch;
pub mod logrec;
pub mod lsn;
pub mod ringbuf;
pub mod storage;
pub mod worker;

pub use archive::{ArchiveIndex, ArchiveScan, NodeFetch};
pub use config::ArchiveConfig;
pub use consumer::LogConsumer;
pub use error::{Error, Result};
pub use latch::{Latch, LatchMode, Latched};
pub use logrec::LogRecord;
pub use lsn::Lsn;
pub use storage::LogStorage;
