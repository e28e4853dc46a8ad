// Event Preprocessor Pipeline
// Ordered, event-type-scoped transformers that may mutate events in place
// before the dispatcher emits them

use std::sync::Arc;

use thiserror::Error;

use crate::client::MatrixClient;
use crate::events::RoomEvent;

/// Which stream an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RoomEvent,
    EphemeralEvent,
}

#[derive(Debug, Error)]
#[error("Preprocessor failed: {0}")]
pub struct PreprocessorError(pub String);

/// A transformer scoped to a set of event types. Mutations are visible to
/// later preprocessors and to every downstream consumer.
#[async_trait::async_trait]
pub trait EventPreprocessor: Send + Sync {
    /// Event types this preprocessor wants to see.
    fn event_types(&self) -> Vec<String>;

    async fn process(
        &self,
        event: &mut RoomEvent,
        client: &dyn MatrixClient,
        kind: EventKind,
    ) -> Result<(), PreprocessorError>;
}

/// Runs preprocessors in registration order. An error aborts the pipeline
/// for that event only; the caller drops the event and moves on.
pub struct PreprocessorPipeline {
    preprocessors: Vec<Arc<dyn EventPreprocessor>>,
}

impl PreprocessorPipeline {
    pub fn new() -> Self {
        Self {
            preprocessors: Vec::new(),
        }
    }

    pub fn add(&mut self, preprocessor: Arc<dyn EventPreprocessor>) {
        self.preprocessors.push(preprocessor);
    }

    pub fn is_empty(&self) -> bool {
        self.preprocessors.is_empty()
    }

    pub async fn run(
        &self,
        event: &mut RoomEvent,
        client: &dyn MatrixClient,
        kind: EventKind,
    ) -> Result<(), PreprocessorError> {
        for preprocessor in &self.preprocessors {
            if !preprocessor
                .event_types()
                .iter()
                .any(|t| t == &event.event_type)
            {
                continue;
            }
            preprocessor.process(event, client, kind).await?;
        }
        Ok(())
    }
}

impl Default for PreprocessorPipeline {
    fn default() -> Self {
        Self::new()
    }
}
