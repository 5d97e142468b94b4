//! Stage registry — the canonical, ordered set of stages in a pipeline.
//!
//! Registration order is significant: it is the tie-break for every ordering
//! the engine produces (ready sets, dispatch order, skip lists).

use std::collections::HashMap;
use std::time::Duration;

use work::Work;

use crate::{EngineError, RetryPolicy, Stage};

/// Stages indexed by ID, kept in registration order.
///
/// Stages are immutable once registered: the registry only hands out shared
/// references.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage.
    ///
    /// # Errors
    /// [`EngineError::DuplicateStage`] if `id` is already registered; the
    /// registry is left unchanged.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        work: Work,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<usize, EngineError> {
        self.insert(Stage {
            id: id.into(),
            work,
            retry: RetryPolicy::new(retries, retry_delay),
        })
    }

    /// Register a fully built stage and return its position.
    pub fn insert(&mut self, stage: Stage) -> Result<usize, EngineError> {
        if self.index.contains_key(&stage.id) {
            return Err(EngineError::DuplicateStage(stage.id));
        }
        let position = self.stages.len();
        self.index.insert(stage.id.clone(), position);
        self.stages.push(stage);
        Ok(position)
    }

    /// Look up a stage by ID.
    ///
    /// # Errors
    /// [`EngineError::UnknownStage`] if no such stage exists.
    pub fn get(&self, id: &str) -> Result<&Stage, EngineError> {
        self.position(id).map(|i| &self.stages[i])
    }

    /// Registration position of `id`.
    pub fn position(&self, id: &str) -> Result<usize, EngineError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::UnknownStage {
                stage_id: id.to_owned(),
                role: "lookup",
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// Stage IDs in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.id.as_str())
    }

    pub(crate) fn at(&self, position: usize) -> &Stage {
        &self.stages[position]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(text: &str) -> Work {
        Work::sql(text)
    }

    #[test]
    fn register_and_get() {
        let mut registry = StageRegistry::new();
        registry
            .register("refresh_dim_lga", sql("select 1"), 2, Duration::from_secs(300))
            .unwrap();

        let stage = registry.get("refresh_dim_lga").unwrap();
        assert_eq!(stage.retry.max_retries, 2);
        assert_eq!(stage.retry.retry_delay, Duration::from_secs(300));
        assert_eq!(stage.work, sql("select 1"));
    }

    #[test]
    fn duplicate_registration_leaves_registry_unchanged() {
        let mut registry = StageRegistry::new();
        registry.register("a", sql("select 1"), 0, Duration::ZERO).unwrap();
        registry.register("b", sql("select 2"), 0, Duration::ZERO).unwrap();

        let err = registry.register("a", sql("select 3"), 5, Duration::ZERO).unwrap_err();

        assert!(matches!(err, EngineError::DuplicateStage(id) if id == "a"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a").unwrap().work, sql("select 1"));
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn unknown_lookup_fails() {
        let registry = StageRegistry::new();
        assert!(matches!(
            registry.get("ghost"),
            Err(EngineError::UnknownStage { stage_id, role: "lookup" }) if stage_id == "ghost"
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn positions_follow_registration_order() {
        let mut registry = StageRegistry::new();
        for id in ["c", "a", "b"] {
            registry.register(id, sql("select 1"), 0, Duration::ZERO).unwrap();
        }
        assert_eq!(registry.position("c").unwrap(), 0);
        assert_eq!(registry.position("b").unwrap(), 2);
        assert!(registry.contains("a"));
        assert_eq!(registry.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["c", "a", "b"]);
    }
}
