use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Event, Turn};

/// Replays one orchestration turn over a history snapshot.
///
/// The runtime only depends on this trait, so a test can substitute an
/// engine that injects mismatches or records the histories it was given.
pub trait ReplayEngine: Send + Sync {
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> Turn<Result<String, String>>;
}

#[derive(Default)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> Turn<Result<String, String>> {
        crate::run_turn_with(instance, history, move |ctx| async move { handler.invoke(ctx, input).await })
    }
}
