/// Store behaviour switches.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Log background reload failures at `warn`. They are never surfaced.
    pub log_background_failures: bool,
    /// A background reload requested while any fetch for the same target is
    /// pending does not issue another fetch.
    pub coalesce_background_reloads: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            log_background_failures: true,
            coalesce_background_reloads: true,
        }
    }
}
