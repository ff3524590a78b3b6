use crate::application::catalog::ToolCatalog;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Undiscovered,
    Discovered,
    Invoked,
}

#[derive(Debug, Error)]
pub enum LoadingError {
    #[error("tool '{id}' has not been discovered in this conversation")]
    NotDiscovered { id: String },
    #[error("tool '{id}' is not tracked by this conversation")]
    Untracked { id: String },
}

/// Per-conversation record of which tools the model has been shown and
/// which it has invoked. Transitions only move forward
/// (undiscovered → discovered → invoked); all mutation is serialized behind
/// one mutex so concurrent completions cannot regress a state.
pub struct LoadingTracker {
    states: Mutex<HashMap<String, LoadState>>,
}

impl LoadingTracker {
    pub fn new(catalog: &ToolCatalog) -> Self {
        let states = catalog
            .iter()
            .map(|tool| {
                let state = if tool.eager {
                    LoadState::Discovered
                } else {
                    LoadState::Undiscovered
                };
                (tool.id.clone(), state)
            })
            .collect();
        Self {
            states: Mutex::new(states),
        }
    }

    /// Idempotent: re-marking a discovered or invoked tool is a no-op.
    pub fn mark_discovered(&self, ids: &[String]) {
        let mut states = self.states.lock().expect("loading state lock");
        for id in ids {
            if let Some(state) = states.get_mut(id) {
                if *state == LoadState::Undiscovered {
                    debug!(tool = %id, "Tool discovered");
                    *state = LoadState::Discovered;
                }
            }
        }
    }

    pub fn mark_invoked(&self, id: &str) -> Result<(), LoadingError> {
        let mut states = self.states.lock().expect("loading state lock");
        match states.get_mut(id) {
            Some(state @ (LoadState::Discovered | LoadState::Invoked)) => {
                *state = LoadState::Invoked;
                Ok(())
            }
            Some(LoadState::Undiscovered) => Err(LoadingError::NotDiscovered { id: id.into() }),
            None => Err(LoadingError::Untracked { id: id.into() }),
        }
    }

    /// True iff the model has been shown this tool (discovered or invoked).
    pub fn is_callable(&self, id: &str) -> bool {
        let states = self.states.lock().expect("loading state lock");
        matches!(
            states.get(id),
            Some(LoadState::Discovered | LoadState::Invoked)
        )
    }

    pub fn state(&self, id: &str) -> Option<LoadState> {
        self.states.lock().expect("loading state lock").get(id).copied()
    }

    /// Sorted ids of every tool with state other than undiscovered; this is
    /// what the model is told it may call.
    pub fn visible_set(&self) -> Vec<String> {
        let states = self.states.lock().expect("loading state lock");
        let mut visible: Vec<String> = states
            .iter()
            .filter(|(_, state)| **state != LoadState::Undiscovered)
            .map(|(id, _)| id.clone())
            .collect();
        visible.sort();
        visible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::catalog::descriptor;

    fn tracker() -> LoadingTracker {
        let catalog = ToolCatalog::new(vec![
            descriptor("a", "eager tool", true),
            descriptor("b", "deferred tool", false),
            descriptor("c", "another deferred tool", false),
        ])
        .expect("catalog builds");
        LoadingTracker::new(&catalog)
    }

    #[test]
    fn eager_tools_start_discovered() {
        let tracker = tracker();
        assert_eq!(tracker.visible_set(), vec!["a".to_string()]);
        assert!(tracker.is_callable("a"));
        assert!(!tracker.is_callable("b"));
    }

    #[test]
    fn invoking_undiscovered_tool_fails() {
        let tracker = tracker();
        let err = tracker.mark_invoked("b").expect_err("must be rejected");
        assert!(matches!(err, LoadingError::NotDiscovered { id } if id == "b"));
        assert_eq!(tracker.state("b"), Some(LoadState::Undiscovered));
    }

    #[test]
    fn discovery_then_invocation_moves_forward_only() {
        let tracker = tracker();
        tracker.mark_discovered(&["b".to_string()]);
        assert!(tracker.is_callable("b"));

        tracker.mark_invoked("b").expect("invocation allowed");
        assert_eq!(tracker.state("b"), Some(LoadState::Invoked));

        // Re-discovery never regresses an invoked tool.
        tracker.mark_discovered(&["b".to_string()]);
        assert_eq!(tracker.state("b"), Some(LoadState::Invoked));
    }

    #[test]
    fn mark_discovered_is_idempotent_and_ignores_unknown_ids() {
        let tracker = tracker();
        tracker.mark_discovered(&["c".to_string(), "c".to_string(), "ghost".to_string()]);
        assert_eq!(tracker.state("c"), Some(LoadState::Discovered));
        assert_eq!(tracker.state("ghost"), None);
        assert_eq!(tracker.visible_set(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn invoked_tools_stay_in_visible_set() {
        let tracker = tracker();
        tracker.mark_discovered(&["b".to_string()]);
        tracker.mark_invoked("b").expect("invocation allowed");
        assert!(tracker.visible_set().contains(&"b".to_string()));
    }
}
