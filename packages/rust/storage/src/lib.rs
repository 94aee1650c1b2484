//! Durable state for Varnika.
//!
//! - [`SourcesLedger`]: the topic-grouped Markdown file of discovered sources,
//!   with locked mutations and rolling backups
//! - [`JobStore`]: job records, kept in libSQL by [`SqlJobStore`] or in memory
//!   by [`MemoryJobStore`]
//! - [`TrackerLease`]: tells a job tracker whether it is the only one alive
//!   on a job database
//! - [`write_atomic`]: temp-file-and-rename writes used for every artifact

mod fsutil;
mod jobs;
mod lease;
pub mod ledger;
mod migrations;

pub use fsutil::{read_or_empty, write_atomic};
pub use jobs::{JobPage, JobStore, MemoryJobStore, SqlJobStore};
pub use lease::TrackerLease;
pub use ledger::{AppendOutcome, BackupInfo, SourcesLedger, parse_records};
