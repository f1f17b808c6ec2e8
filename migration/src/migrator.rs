use sea_orm_migration::prelude::*;

use crate::migrations;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(migrations::m202610010001_create_problems::Migration),
            Box::new(migrations::m202610010002_create_assignments::Migration),
            Box::new(migrations::m202610010003_create_assignment_problems::Migration),
            Box::new(migrations::m202610010004_create_assignment_users::Migration),
            Box::new(migrations::m202610010005_create_submissions::Migration),
            Box::new(migrations::m202610010006_create_best_submissions::Migration),
            Box::new(migrations::m202610010007_create_roster_sync_failures::Migration),
        ]
    }
}
