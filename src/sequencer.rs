//! Cursor over an ordered response list.

use crate::policy::ExhaustedPolicy;
use crate::script::ResponseSpec;

/// Result of asking the sequencer for the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Entry at this index was served and is now consumed
    Served(usize),
    /// Unconsumed entries remain but none accepts the request
    NoMatch,
    /// Every entry was consumed and the policy does not wrap
    Exhausted,
}

/// Tracks which entries of a list were consumed.
///
/// Entries are scanned from the cursor in declaration order and the first one
/// that accepts the request is consumed. Positional entries accept anything,
/// so they are always served strictly in order.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    consumed: Vec<bool>,
    cursor: usize,
    rounds: u32,
}

impl Sequencer {
    pub fn new(len: usize) -> Self {
        Self {
            consumed: vec![false; len],
            cursor: 0,
            rounds: 0,
        }
    }

    /// Index of the first unconsumed entry.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of times the list wrapped around.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn served(&self) -> usize {
        self.consumed.iter().filter(|c| **c).count()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.consumed.len()
    }

    /// Track `additional` new entries appended to the list.
    pub fn extend(&mut self, additional: usize) {
        self.consumed.extend(std::iter::repeat(false).take(additional));
    }

    pub fn advance(
        &mut self,
        entries: &[ResponseSpec],
        user_text: &str,
        on_exhausted: ExhaustedPolicy,
    ) -> Advance {
        debug_assert_eq!(entries.len(), self.consumed.len());

        if entries.is_empty() {
            return Advance::Exhausted;
        }

        if self.is_exhausted() {
            match on_exhausted {
                ExhaustedPolicy::Error => return Advance::Exhausted,
                ExhaustedPolicy::Wrap => self.rewind(),
            }
        }

        if let Some(index) = self.take(entries, user_text) {
            return Advance::Served(index);
        }

        // Keyed entries nobody asked for must not keep a wrapping list from
        // starting over once its positional entries are used up.
        if on_exhausted == ExhaustedPolicy::Wrap
            && !self.positional_pending(entries)
            && entries.iter().any(|entry| entry.accepts(user_text))
        {
            self.rewind();
            if let Some(index) = self.take(entries, user_text) {
                return Advance::Served(index);
            }
        }

        Advance::NoMatch
    }

    fn take(&mut self, entries: &[ResponseSpec], user_text: &str) -> Option<usize> {
        let index = (self.cursor..entries.len())
            .find(|&i| !self.consumed[i] && entries[i].accepts(user_text))?;
        self.consumed[index] = true;
        self.settle();
        Some(index)
    }

    fn positional_pending(&self, entries: &[ResponseSpec]) -> bool {
        entries
            .iter()
            .zip(&self.consumed)
            .any(|(entry, consumed)| !consumed && matches!(entry, ResponseSpec::Positional(_)))
    }

    fn rewind(&mut self) {
        self.consumed.iter_mut().for_each(|c| *c = false);
        self.cursor = 0;
        self.rounds += 1;
    }

    fn settle(&mut self) {
        while self.cursor < self.consumed.len() && self.consumed[self.cursor] {
            self.cursor += 1;
        }
    }
}
