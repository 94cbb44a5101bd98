//! Engine error taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the mock engine.
///
/// Only [`EngineError::Configuration`] is fatal; every other variant is scoped
/// to a single request, message, or actor iteration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Malformed or contradictory service definition.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing variable or bad expression in a template.
    #[error("template render error: {0}")]
    TemplateRender(String),

    /// No variant carries the requested tag.
    #[error("tag not found: {0}")]
    TagNotFound(String),

    /// The rendering worker has shut down.
    #[error("engine stopped")]
    EngineStopped,

    /// The caller gave up waiting for a rendering job.
    #[error("rendering timed out after {0:?}")]
    RenderTimeout(Duration),

    /// Broker send or receive failed.
    #[error("broker transport error: {0}")]
    BrokerTransport(String),

    /// A payload does not have the declared shape.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("actor not found: {0}")]
    ActorNotFound(String),

    #[error("actor {0} is stopped")]
    ActorStopped(String),

    #[error("engine already started")]
    AlreadyStarted,
}

impl EngineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
