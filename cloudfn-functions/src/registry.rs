//! Function registry
//!
//! Holds the authoritative set of function records in memory and mirrors it
//! to a single snapshot file. Every mutation rewrites the whole snapshot
//! while holding the exclusive lock; a failed write rolls the in-memory
//! change (and the function's source directory) back before returning.
//!
//! The snapshot is rewritten in place. A crash in the middle of a write can
//! leave a truncated file, which is reported as a load error on the next
//! start rather than repaired.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::function::Function;

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Function not found: {0}")]
    NotFound(String),

    #[error("Failed to persist registry snapshot: {0}")]
    Persistence(String),

    #[error("Failed to load registry snapshot: {0}")]
    Load(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Durable storage for the full function collection
pub trait SnapshotStore: Send + Sync {
    /// Load every stored function
    fn load(&self) -> Result<Vec<Function>, RegistryError>;

    /// Replace the stored collection with `functions`
    fn save(&self, functions: &[Function]) -> Result<(), RegistryError>;
}

/// JSON array snapshot on the local filesystem
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Vec<Function>, RegistryError> {
        if !self.path.exists() {
            self.save(&[])?;
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| RegistryError::Load(format!("{}: {}", self.path.display(), e)))?;

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content)
            .map_err(|e| RegistryError::Load(format!("{}: {}", self.path.display(), e)))
    }

    fn save(&self, functions: &[Function]) -> Result<(), RegistryError> {
        let content = serde_json::to_string_pretty(functions)
            .map_err(|e| RegistryError::Persistence(format!("serialize: {e}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RegistryError::Persistence(format!("{}: {}", parent.display(), e))
            })?;
        }

        fs::write(&self.path, content)
            .map_err(|e| RegistryError::Persistence(format!("{}: {}", self.path.display(), e)))
    }
}

/// In-memory function map guarded by a single reader/writer lock
pub struct FunctionRegistry {
    work_dir: PathBuf,
    store: Box<dyn SnapshotStore>,
    functions: RwLock<HashMap<String, Function>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("work_dir", &self.work_dir)
            .field("functions", &self.functions.read().len())
            .finish_non_exhaustive()
    }
}

impl FunctionRegistry {
    /// Open a registry rooted at `work_dir`, persisted to `snapshot_path`
    pub fn open(
        work_dir: impl AsRef<Path>,
        snapshot_path: impl AsRef<Path>,
    ) -> Result<Self, RegistryError> {
        let store = FileSnapshotStore::new(snapshot_path);
        debug!(snapshot = %store.path().display(), "Opening registry snapshot");
        Self::with_store(work_dir, store)
    }

    /// Open a registry backed by an arbitrary snapshot store
    pub fn with_store(
        work_dir: impl AsRef<Path>,
        store: impl SnapshotStore + 'static,
    ) -> Result<Self, RegistryError> {
        let work_dir = work_dir.as_ref().to_path_buf();
        fs::create_dir_all(&work_dir)?;

        let loaded = store.load()?;
        let functions: HashMap<String, Function> = loaded
            .into_iter()
            .map(|function| (function.id.clone(), function))
            .collect();

        info!(
            work_dir = %work_dir.display(),
            count = functions.len(),
            "Loaded function registry"
        );

        Ok(Self {
            work_dir,
            store: Box::new(store),
            functions: RwLock::new(functions),
        })
    }

    /// Directory holding the canonical source copy of a function
    pub fn function_dir(&self, id: &str) -> PathBuf {
        self.work_dir.join(id)
    }

    /// Register a new function
    ///
    /// Assigns the ID and both timestamps, writes the source to the
    /// function's directory and persists the snapshot.
    pub fn create(&self, mut function: Function) -> Result<Function, RegistryError> {
        let mut functions = self.functions.write();

        let mut id = generate_id();
        while functions.contains_key(&id) {
            id = generate_id();
        }

        let now = Utc::now();
        function.id = id.clone();
        function.created_at = now;
        function.updated_at = now;

        let dir = self.function_dir(&id);
        if let Err(e) = self.write_source(&function) {
            remove_dir_best_effort(&dir);
            return Err(e.into());
        }

        functions.insert(id.clone(), function.clone());

        if let Err(e) = self.persist(&functions) {
            functions.remove(&id);
            remove_dir_best_effort(&dir);
            warn!(function_id = %id, error = %e, "Rolled back function create");
            return Err(e);
        }

        info!(
            function_id = %id,
            name = %function.name,
            runtime = %function.runtime,
            "Created function"
        );

        Ok(function)
    }

    /// Get a function by ID
    pub fn get(&self, id: &str) -> Result<Function, RegistryError> {
        self.functions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// List all functions
    pub fn list(&self) -> Vec<Function> {
        self.functions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace a function with a complete new record
    ///
    /// Keeps the stored `id` and `created_at`; `updated_at` never moves
    /// backwards.
    pub fn update(&self, id: &str, mut function: Function) -> Result<Function, RegistryError> {
        let mut functions = self.functions.write();

        let previous = functions
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        function.id = previous.id.clone();
        function.created_at = previous.created_at;
        function.updated_at = Utc::now().max(previous.updated_at);

        if let Err(e) = self.write_source(&function) {
            self.restore_source(&previous, &function);
            return Err(e.into());
        }
        if previous.runtime != function.runtime {
            remove_file_best_effort(&self.source_path(&previous));
        }

        functions.insert(id.to_string(), function.clone());

        if let Err(e) = self.persist(&functions) {
            functions.insert(id.to_string(), previous.clone());
            self.restore_source(&previous, &function);
            warn!(function_id = %id, error = %e, "Rolled back function update");
            return Err(e);
        }

        info!(function_id = %id, runtime = %function.runtime, "Updated function");
        Ok(function)
    }

    /// Remove a function and its working directory
    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let mut functions = self.functions.write();

        let previous = functions
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let dir = self.function_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        functions.remove(id);

        if let Err(e) = self.persist(&functions) {
            functions.insert(id.to_string(), previous.clone());
            if let Err(restore) = self.write_source(&previous) {
                warn!(
                    function_id = %id,
                    error = %restore,
                    "Failed to restore function directory after aborted delete"
                );
            }
            warn!(function_id = %id, error = %e, "Rolled back function delete");
            return Err(e);
        }

        info!(function_id = %id, "Deleted function");
        Ok(())
    }

    fn persist(&self, functions: &HashMap<String, Function>) -> Result<(), RegistryError> {
        let mut snapshot: Vec<Function> = functions.values().cloned().collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        self.store.save(&snapshot)?;
        debug!(count = snapshot.len(), "Persisted registry snapshot");
        Ok(())
    }

    fn source_path(&self, function: &Function) -> PathBuf {
        self.function_dir(&function.id)
            .join(function.runtime.source_file())
    }

    fn write_source(&self, function: &Function) -> io::Result<()> {
        fs::create_dir_all(self.function_dir(&function.id))?;
        fs::write(self.source_path(function), &function.code)
    }

    /// Put `previous`'s source back after `attempted` failed to stick
    fn restore_source(&self, previous: &Function, attempted: &Function) {
        if previous.runtime != attempted.runtime {
            remove_file_best_effort(&self.source_path(attempted));
        }
        if let Err(e) = self.write_source(previous) {
            warn!(function_id = %previous.id, error = %e, "Failed to restore function source");
        }
    }
}

fn generate_id() -> String {
    format!("fn_{}", Uuid::new_v4().simple())
}

fn remove_dir_best_effort(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove function directory");
        }
    }
}

fn remove_file_best_effort(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove stale source file");
        }
    }
}
