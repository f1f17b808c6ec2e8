//! Lifecycle timestamp capability shared by every entity.
//!
//! Each `ActiveModel` implements [`Timestamped`] explicitly and calls
//! [`Timestamped::stamp`] from its `before_save` hook. Bulk writers
//! (`insert_many`, `update_many`) bypass the hook and call `stamp` themselves.

use chrono::{DateTime, Utc};

pub trait Timestamped {
    fn set_created_at(&mut self, at: DateTime<Utc>);

    fn set_updated_at(&mut self, at: DateTime<Utc>);

    /// Sets `updated_at`, and `created_at` as well when inserting.
    fn stamp(&mut self, at: DateTime<Utc>, insert: bool) {
        if insert {
            self.set_created_at(at);
        }
        self.set_updated_at(at);
    }
}
