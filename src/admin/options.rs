use crate::storage::DbOptions;

/// Common options used when opening a database for administrative commands.
#[derive(Clone, Debug, Default)]
pub struct AdminOpenOptions {
    /// Options handed to the group.
    pub db: DbOptions,
}

impl AdminOpenOptions {
    /// Options for read-only inspection: no fsync, no verification on open
    /// (the verify command runs its own walk and reports findings instead of failing).
    pub fn inspect() -> Self {
        Self {
            db: DbOptions::default()
                .sync_on_commit(false)
                .verify_on_open(false),
        }
    }
}
