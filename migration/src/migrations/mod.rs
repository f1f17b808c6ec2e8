pub mod m202610010001_create_problems;
pub mod m202610010002_create_assignments;
pub mod m202610010003_create_assignment_problems;
pub mod m202610010004_create_assignment_users;
pub mod m202610010005_create_submissions;
pub mod m202610010006_create_best_submissions;
pub mod m202610010007_create_roster_sync_failures;
