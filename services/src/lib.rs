//! Assignment roster and best-submission consistency engine.
//!
//! Keeps assignment participants aligned with class rosters, participant max
//! scores aligned with problem sets, and a single best graded submission per
//! participant and problem.

pub mod assignment_store;
pub mod best_submission;
pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod participation;
pub mod roster;
pub mod roster_sync;
pub mod score_aggregator;
pub mod statistics;
pub mod sync_worker;

pub use db::models::assignment::AssignmentStatus;
pub use db::models::assignment_user::ParticipantStatus;
pub use db::models::roster_sync_failure::SyncMode;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
