use std::collections::HashMap;
use std::sync::Arc;

use mindstream_core::event::ToolType;
use mindstream_core::tools::{BlockingExecutor, Executor};

use crate::error::EngineError;

/// Maps each tool type to the executor that performs it.
pub struct ExecutorRegistry<E: ?Sized> {
    executors: HashMap<ToolType, Arc<E>>,
}

/// Registry used by the async orchestrator.
pub type Executors = ExecutorRegistry<dyn Executor>;
/// Registry used by the blocking orchestrator.
pub type BlockingExecutors = ExecutorRegistry<dyn BlockingExecutor>;

impl<E: ?Sized> ExecutorRegistry<E> {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, returning the one it replaces.
    pub fn register(&mut self, tool_type: ToolType, executor: Arc<E>) -> Option<Arc<E>> {
        self.executors.insert(tool_type, executor)
    }

    pub fn with(mut self, tool_type: ToolType, executor: Arc<E>) -> Self {
        self.register(tool_type, executor);
        self
    }

    pub fn unregister(&mut self, tool_type: ToolType) -> bool {
        self.executors.remove(&tool_type).is_some()
    }

    pub fn get(&self, tool_type: ToolType) -> Option<Arc<E>> {
        self.executors.get(&tool_type).map(Arc::clone)
    }

    pub fn contains(&self, tool_type: ToolType) -> bool {
        self.executors.contains_key(&tool_type)
    }

    /// Registered tool types, sorted.
    pub fn tool_types(&self) -> Vec<ToolType> {
        let mut types: Vec<ToolType> = self.executors.keys().copied().collect();
        types.sort();
        types
    }

    pub fn count(&self) -> usize {
        self.executors.len()
    }

    /// Look up the executor for a dispatched tool type.
    pub fn require(&self, tool_type: ToolType) -> Result<Arc<E>, EngineError> {
        self.get(tool_type)
            .ok_or(EngineError::MissingExecutor(tool_type))
    }

    /// Fails with the first required tool type that has no executor.
    pub fn validate(&self, required: &[ToolType]) -> Result<(), EngineError> {
        match required.iter().find(|t| !self.contains(**t)) {
            Some(missing) => Err(EngineError::MissingExecutor(*missing)),
            None => Ok(()),
        }
    }
}

impl<E: ?Sized> Default for ExecutorRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
