use std::collections::VecDeque;

/// Most-recently-used list of distinct submitted prompts, newest first.
#[derive(Debug, Clone)]
pub struct RecentPrompts {
    prompts: VecDeque<String>,
    capacity: usize,
}

impl RecentPrompts {
    pub fn new(capacity: usize) -> Self {
        Self {
            prompts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn from_saved(saved: Vec<String>, capacity: usize) -> Self {
        let mut ledger = Self::new(capacity);
        // oldest first so the saved front ends up at the front again
        for prompt in saved.into_iter().rev() {
            ledger.record(&prompt);
        }
        ledger
    }

    /// Move `prompt` to the front, evicting the oldest entry past capacity.
    /// Returns false when the ledger is unchanged.
    pub fn record(&mut self, prompt: &str) -> bool {
        let prompt = prompt.trim();
        if prompt.is_empty() || self.capacity == 0 {
            return false;
        }
        if self.prompts.front().is_some_and(|front| front == prompt) {
            return false;
        }

        self.prompts.retain(|p| p != prompt);
        self.prompts.push_front(prompt.to_string());
        self.prompts.truncate(self.capacity);
        true
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.prompts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}
