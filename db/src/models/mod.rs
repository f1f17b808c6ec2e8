pub mod assignment;
pub mod assignment_problem;
pub mod assignment_user;
pub mod best_submission;
pub mod problem;
pub mod roster_sync_failure;
pub mod submission;

pub use assignment::Entity as Assignment;
pub use assignment_problem::Entity as AssignmentProblem;
pub use assignment_user::Entity as AssignmentUser;
pub use best_submission::Entity as BestSubmission;
pub use problem::Entity as Problem;
pub use roster_sync_failure::Entity as RosterSyncFailure;
pub use submission::Entity as Submission;
