//! Session configuration.

/// Per-session configuration, fixed at construction.
///
/// Nothing here is global: two sessions over the same store may use
/// different settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Whether reading an unloaded navigation loads it from storage.
    pub lazy_loading: bool,

    /// Whether to scan Unchanged entries for modifications before a save
    /// and before listing entries.
    pub auto_detect_changes: bool,

    /// Whether updates and deletes of entity types without a concurrency
    /// token carry the original snapshot values in their write predicate.
    pub snapshot_predicates: bool,

    /// Whether every executed statement emits a `debug` event.
    pub trace_statements: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lazy_loading: true,
            auto_detect_changes: true,
            snapshot_predicates: true,
            trace_statements: false,
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether navigations load lazily.
    #[must_use]
    pub const fn lazy_loading(mut self, value: bool) -> Self {
        self.lazy_loading = value;
        self
    }

    /// Sets whether change detection runs automatically.
    #[must_use]
    pub const fn auto_detect_changes(mut self, value: bool) -> Self {
        self.auto_detect_changes = value;
        self
    }

    /// Sets whether snapshot values guard updates without a token.
    #[must_use]
    pub const fn snapshot_predicates(mut self, value: bool) -> Self {
        self.snapshot_predicates = value;
        self
    }

    /// Sets whether statements are traced.
    #[must_use]
    pub const fn trace_statements(mut self, value: bool) -> Self {
        self.trace_statements = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SessionConfig::default();
        assert!(config.lazy_loading);
        assert!(config.auto_detect_changes);
        assert!(config.snapshot_predicates);
        assert!(!config.trace_statements);
    }

    #[test]
    fn builder_pattern() {
        let config = SessionConfig::new()
            .lazy_loading(false)
            .snapshot_predicates(false)
            .trace_statements(true);

        assert!(!config.lazy_loading);
        assert!(!config.snapshot_predicates);
        assert!(config.trace_statements);
        assert!(config.auto_detect_changes);
    }
}
