// ABOUTME: Implements the TaskRegistry - a thread-safe table of task modules
// ABOUTME: keyed by worker path, used as the stock TaskLoader.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Task, TaskLoader};
use crate::error::WorkerError;

/// A loadable unit: an optional default task plus named exports.
#[derive(Clone, Default)]
pub struct TaskModule {
    default: Option<Arc<dyn Task>>,
    exports: HashMap<String, Arc<dyn Task>>,
}

impl TaskModule {
    /// Create an empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task used when no export name is requested.
    pub fn with_default<T: Task + 'static>(mut self, task: T) -> Self {
        self.default = Some(Arc::new(task));
        self
    }

    /// Add a named export.
    pub fn export<T: Task + 'static>(mut self, name: impl Into<String>, task: T) -> Self {
        self.exports.insert(name.into(), Arc::new(task));
        self
    }

    /// Resolve the default task or a named export.
    pub fn resolve(&self, exported_method: Option<&str>) -> Option<Arc<dyn Task>> {
        match exported_method {
            Some(name) => self.exports.get(name).cloned(),
            None => self.default.clone(),
        }
    }

    /// Names of all exports, sorted alphabetically.
    pub fn export_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.exports.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A thread-safe registry of task modules.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    modules: Arc<RwLock<HashMap<String, TaskModule>>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under `worker_path`, replacing any previous one.
    pub async fn register(&self, worker_path: impl Into<String>, module: TaskModule) {
        let mut modules = self.modules.write().await;
        modules.insert(worker_path.into(), module);
    }

    /// Register a single task as the default export of `worker_path`.
    pub async fn register_task<T: Task + 'static>(&self, worker_path: impl Into<String>, task: T) {
        self.register(worker_path, TaskModule::new().with_default(task))
            .await;
    }

    /// Unregister a module.
    pub async fn unregister(&self, worker_path: &str) {
        let mut modules = self.modules.write().await;
        modules.remove(worker_path);
    }

    /// Get a module by path.
    pub async fn get(&self, worker_path: &str) -> Option<TaskModule> {
        let modules = self.modules.read().await;
        modules.get(worker_path).cloned()
    }

    /// List all module paths, sorted alphabetically.
    pub async fn list(&self) -> Vec<String> {
        let modules = self.modules.read().await;
        let mut paths: Vec<_> = modules.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Get the number of registered modules.
    pub async fn count(&self) -> usize {
        let modules = self.modules.read().await;
        modules.len()
    }
}

#[async_trait]
impl TaskLoader for TaskRegistry {
    async fn load(
        &self,
        worker_path: &str,
        exported_method: Option<&str>,
    ) -> Result<Arc<dyn Task>, WorkerError> {
        let module = self.get(worker_path).await.ok_or_else(|| WorkerError::Load {
            path: worker_path.to_string(),
            message: "no module registered at this path".into(),
        })?;

        module.resolve(exported_method).ok_or_else(|| {
            let message = match exported_method {
                Some(name) => format!(
                    "no export named '{}' (available: {})",
                    name,
                    module.export_names().join(", ")
                ),
                None => "module has no default export".to_string(),
            };
            WorkerError::Load {
                path: worker_path.to_string(),
                message,
            }
        })
    }
}
