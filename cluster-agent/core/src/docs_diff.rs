use std::collections::HashSet;

/// Tracks which mappings were seen in consecutive scraping rounds.
///
/// After a round that reported set `A` and a round that reported set `B`, [`DocsDiff::new_round`]
/// returns exactly `A ∖ B`.
#[derive(Clone, Debug, Default)]
pub struct DocsDiff {
    previous: HashSet<String>,
    current: HashSet<String>,
}

impl DocsDiff {
    /// Seeds the tracker with keys that are already stored.
    pub fn new<I: IntoIterator<Item = String>>(known: I) -> Self {
        Self {
            previous: known.into_iter().collect(),
            current: HashSet::new(),
        }
    }

    /// Marks a key as present in the current round.
    pub fn add(&mut self, key: impl Into<String>) {
        self.current.insert(key.into());
    }

    /// Closes the current round, returning the keys that disappeared since the previous one.
    pub fn new_round(&mut self) -> Vec<String> {
        let current = std::mem::take(&mut self.current);
        let mut deleted = self
            .previous
            .difference(&current)
            .cloned()
            .collect::<Vec<_>>();
        deleted.sort();
        self.previous = current;
        deleted
    }
}
