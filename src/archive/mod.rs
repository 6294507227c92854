//! The log archive: leveled index of sorted runs, merge scans over them,
//! and the node-fetch replay driver.
//!
//! ```text
//!                 +--------------+    probe     +--------------+
//!  run builder -->| ArchiveIndex |------------->| ArchiveScan  |
//!  (appender)     |  runs/levels |  mmap runs   |  merge heap  |
//!                 +--------------+              +--------------+
//!                                                      |
//!                                               +------------+
//!                                               | NodeFetch  |--> page
//!                                               +------------+
//! ```

pub mod fetch;
pub mod index;
pub mod scan;

pub use fetch::{NodeFetch, Redoer};
pub use index::{ArchiveIndex, BucketInfo, RunFile, RunId, RunInfo};
pub use scan::{ArchiveScan, ScanRecord};
