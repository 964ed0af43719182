//! Batch-entry core for a small medicine-inventory application.
//!
//! Users attach packaging photos to independent batch entries; an external
//! vision-language API extracts structured attributes; reviewed and approved
//! entries are promoted into permanent inventory records. The interesting
//! part is the per-session orchestration: upload completion tracking, a
//! cancellable debounce countdown, durable analysis jobs with a background
//! worker, and result propagation over a broadcast topic.

pub mod config;
pub mod db;
pub mod entries;
pub mod model;
pub mod promote;
pub mod session;
pub mod storage;
pub mod uploads;
pub mod vision;
pub mod worker;
