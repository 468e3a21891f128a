//! Process-wide shared state: one [`TypeRegistry`], one
//! [`LibraryRegistry`] and one [`CallbackPool`], constructed once at
//! startup and handed to every connection worker behind `Arc`.

use crate::callback::CallbackPool;
use crate::library::LibraryRegistry;
use crate::types::TypeRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct ExecutorState {
    pub types: Arc<TypeRegistry>,
    pub libraries: Arc<LibraryRegistry>,
    pub callbacks: Arc<CallbackPool>,
}

impl Default for ExecutorState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorState {
    pub fn new() -> Self {
        ExecutorState {
            types: Arc::new(TypeRegistry::new()),
            libraries: Arc::new(LibraryRegistry::new()),
            callbacks: Arc::new(CallbackPool::new()),
        }
    }
}
