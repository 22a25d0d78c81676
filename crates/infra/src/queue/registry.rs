//! Handler registry: maps operation kinds to the code that performs them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use retrykit_core::{Command, OperationError, OperationKind};

/// Performs one attempt of a command.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Result<(), OperationError>;
}

#[async_trait]
impl<F, Fut> OperationHandler for F
where
    F: Fn(Command) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> Result<(), OperationError> {
        (self)(command).await
    }
}

/// Registry of handlers keyed by kind pattern.
///
/// Resolution order: exact kind, then `prefix.*` category patterns (longest
/// prefix wins), then the `*` wildcard.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a kind pattern, replacing any previous one.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H)
    where
        H: OperationHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn with<H>(mut self, pattern: impl Into<String>, handler: H) -> Self
    where
        H: OperationHandler + 'static,
    {
        self.register(pattern, handler);
        self
    }

    pub fn resolve(&self, kind: &OperationKind) -> Option<Arc<dyn OperationHandler>> {
        let type_name = kind.as_str();
        if let Some(h) = self.handlers.get(type_name) {
            return Some(Arc::clone(h));
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = type_name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = category {
            return Some(Arc::clone(h));
        }

        self.handlers.get("*").cloned()
    }

    pub fn contains(&self, kind: &OperationKind) -> bool {
        self.resolve(kind).is_some()
    }
}
