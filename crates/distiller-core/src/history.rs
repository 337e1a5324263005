use serde::{Deserialize, Serialize};

pub const PROMPT_HISTORY_LIMIT: usize = 20;

/// Most-recent-first list of prompts used to start runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptHistory {
    entries: Vec<String>,
}

impl PromptHistory {
    pub fn from_entries(entries: Vec<String>) -> Self {
        let mut history = Self::default();
        for entry in entries.into_iter().rev() {
            history.record(&entry);
        }
        history
    }

    /// Moves `prompt` to the front. Blank prompts are ignored.
    pub fn record(&mut self, prompt: &str) -> bool {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return false;
        }
        self.entries.retain(|existing| existing != prompt);
        self.entries.insert(0, prompt.to_string());
        self.entries.truncate(PROMPT_HISTORY_LIMIT);
        true
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_dedupes_and_moves_to_front() {
        let mut history = PromptHistory::default();
        history.record("a");
        history.record("b");
        history.record("a");
        assert_eq!(history.entries(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn record_trims_and_skips_blank() {
        let mut history = PromptHistory::default();
        assert!(!history.record("   "));
        assert!(history.record("  seed  "));
        assert_eq!(history.entries(), ["seed".to_string()]);
    }

    #[test]
    fn capacity_drops_the_oldest() {
        let mut history = PromptHistory::default();
        for i in 0..25 {
            history.record(&format!("prompt {i}"));
        }
        assert_eq!(history.len(), PROMPT_HISTORY_LIMIT);
        assert_eq!(history.entries()[0], "prompt 24");
        assert_eq!(history.entries()[19], "prompt 5");
    }

    #[test]
    fn from_entries_keeps_stored_order() {
        let history = PromptHistory::from_entries(vec![
            "new".to_string(),
            "old".to_string(),
            "new".to_string(),
        ]);
        assert_eq!(history.entries(), ["new".to_string(), "old".to_string()]);
    }
}
