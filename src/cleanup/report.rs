//! Teardown results keyed by resource path.

use std::collections::BTreeMap;
use std::fmt;

use crate::backend::ResourcePath;
use crate::operation::OperationError;

/// Outcome of a cleanup phase.
#[derive(Debug)]
pub struct CleanupReport<E>
where
    E: std::error::Error + 'static,
{
    /// Resources deleted by this run.
    pub removed: Vec<ResourcePath>,
    /// Planned resources that were already gone.
    pub already_absent: Vec<ResourcePath>,
    /// Resources deliberately left in place, with the reason.
    pub retained: BTreeMap<ResourcePath, String>,
    /// Resources that could not be removed.
    pub failures: BTreeMap<ResourcePath, OperationError<E>>,
    /// Groups that were requested but are disabled.
    pub skipped: Vec<String>,
}

impl<E> CleanupReport<E>
where
    E: std::error::Error + 'static,
{
    pub(super) const fn new() -> Self {
        Self {
            removed: Vec::new(),
            already_absent: Vec::new(),
            retained: BTreeMap::new(),
            failures: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }

    /// Reports whether every planned removal succeeded or was unnecessary.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Reports whether `path` failed to be removed.
    #[must_use]
    pub fn failed(&self, path: &ResourcePath) -> bool {
        self.failures.contains_key(path)
    }
}

impl<E> fmt::Display for CleanupReport<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cleanup: {} removed, {} already absent, {} retained, {} failed",
            self.removed.len(),
            self.already_absent.len(),
            self.retained.len(),
            self.failures.len()
        )?;
        for path in &self.removed {
            writeln!(f, "  {path}: removed")?;
        }
        for (path, reason) in &self.retained {
            writeln!(f, "  {path}: retained ({reason})")?;
        }
        for (path, err) in &self.failures {
            writeln!(f, "  {path}: failed: {err}")?;
        }
        for name in &self.skipped {
            writeln!(f, "  {name}: skipped (disabled)")?;
        }
        Ok(())
    }
}
