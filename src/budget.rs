//! Per-rule invocation counters.

/// Counts matches per rule and enforces each rule's `times` limit.
#[derive(Debug, Clone, Default)]
pub struct CallBudget {
    used: Vec<u32>,
}

impl CallBudget {
    pub fn new(rules: usize) -> Self {
        Self {
            used: vec![0; rules],
        }
    }

    /// Track counters for newly appended rules.
    pub fn extend(&mut self, additional: usize) {
        self.used.extend(std::iter::repeat(0).take(additional));
    }

    pub fn used(&self, rule: usize) -> u32 {
        self.used.get(rule).copied().unwrap_or(0)
    }

    /// Whether the rule may still match. `None` means unlimited.
    pub fn is_available(&self, rule: usize, limit: Option<u32>) -> bool {
        limit.map_or(true, |max| self.used(rule) < max)
    }

    pub fn remaining(&self, rule: usize, limit: Option<u32>) -> Option<u32> {
        limit.map(|max| max.saturating_sub(self.used(rule)))
    }

    pub fn consume(&mut self, rule: usize) {
        if let Some(count) = self.used.get_mut(rule) {
            *count = count.saturating_add(1);
        }
    }
}
