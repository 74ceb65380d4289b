//! Append-only feedback log of generation outcomes and human corrections.
//!
//! Entries land in monthly JSONL files (`production_YYYYMM.jsonl`), one
//! `FeedbackEntry` per line. Offline dataset tooling reads them back with
//! [`read_entries`].

mod logger;

pub use logger::{FeedbackLogger, feedback_file_name, read_entries};
