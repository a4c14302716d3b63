//! Resolution of `--libs` values to task-library registration hooks.
//!
//! Dynamic-library mechanics are an external collaborator: a deployment
//! links its task crates into its own worker and executor binaries and
//! inserts their registration hooks here. The stock binaries ship with
//! the built-in sample library. Each `--libs` value is matched by file
//! stem (an optional `lib` prefix is ignored) so a path like
//! `/opt/tasks/libspider_tasklib.so` resolves too.

use std::collections::HashMap;
use std::path::Path;

use spider_client::FunctionRegistry;

use crate::error::WorkerError;

/// Registration hook of one statically linked task library.
pub type RegisterFn = fn(&mut FunctionRegistry);

/// Maps library names to their registration hooks.
pub struct LibraryTable {
    libraries: HashMap<String, RegisterFn>,
}

impl LibraryTable {
    pub fn empty() -> Self {
        Self {
            libraries: HashMap::new(),
        }
    }

    /// The libraries linked into the stock binaries.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.insert("spider_tasklib", spider_tasklib::register);
        table
    }

    pub fn insert(&mut self, name: &str, register: RegisterFn) {
        self.libraries.insert(name.to_string(), register);
    }

    /// Loads every named library into the registry. Unknown names fail the
    /// whole load.
    pub fn load(
        &self,
        paths: &[String],
        registry: &mut FunctionRegistry,
    ) -> Result<(), WorkerError> {
        for path in paths {
            let stem = Path::new(path)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .ok_or_else(|| WorkerError::UnknownLibrary(path.clone()))?;
            let name = stem.strip_prefix("lib").unwrap_or(stem);
            let register = self
                .libraries
                .get(name)
                .ok_or_else(|| WorkerError::UnknownLibrary(path.clone()))?;
            register(registry);
            tracing::debug!(library = name, "task library loaded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_paths_by_stem() {
        let table = LibraryTable::builtin();
        let mut registry = FunctionRegistry::new();
        table
            .load(
                &["/opt/tasks/libspider_tasklib.so".to_string()],
                &mut registry,
            )
            .unwrap();
        assert!(registry.contains("sum"));
    }

    #[test]
    fn unknown_library_fails() {
        let table = LibraryTable::builtin();
        let mut registry = FunctionRegistry::new();
        let result = table.load(&["libno_such_tasks.so".to_string()], &mut registry);
        assert!(matches!(result, Err(WorkerError::UnknownLibrary(_))));
    }
}
