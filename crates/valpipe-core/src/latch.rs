use serde::{Deserialize, Serialize};
use std::fmt;

/// Which path delivered the final result of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    Stream,
    Request,
}

impl CompletionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionSource::Stream => "stream",
            CompletionSource::Request => "request",
        }
    }
}

impl fmt::Display for CompletionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchOutcome {
    Adopted,
    Discarded { holder: CompletionSource },
}

impl LatchOutcome {
    pub fn adopted(&self) -> bool {
        matches!(self, LatchOutcome::Adopted)
    }
}

/// Single-assignment cell: the first offer wins, later offers are dropped.
/// Only `reset` clears it.
#[derive(Debug, Clone)]
pub struct Latch<T> {
    slot: Option<(CompletionSource, T)>,
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<T> Latch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, source: CompletionSource, value: T) -> LatchOutcome {
        match &self.slot {
            Some((holder, _)) => LatchOutcome::Discarded { holder: *holder },
            None => {
                self.slot = Some((source, value));
                LatchOutcome::Adopted
            }
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.slot.as_ref().map(|(_, value)| value)
    }

    pub fn source(&self) -> Option<CompletionSource> {
        self.slot.as_ref().map(|(source, _)| *source)
    }

    pub fn is_set(&self) -> bool {
        self.slot.is_some()
    }

    pub fn reset(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_offer_wins() {
        let mut latch = Latch::new();
        assert!(!latch.is_set());
        assert_eq!(latch.offer(CompletionSource::Stream, "S"), LatchOutcome::Adopted);
        assert_eq!(
            latch.offer(CompletionSource::Request, "R"),
            LatchOutcome::Discarded {
                holder: CompletionSource::Stream
            }
        );
        assert_eq!(latch.get(), Some(&"S"));
        assert_eq!(latch.source(), Some(CompletionSource::Stream));
    }

    #[test]
    fn request_first_then_stream_is_discarded() {
        let mut latch = Latch::new();
        assert!(latch.offer(CompletionSource::Request, 1).adopted());
        assert!(!latch.offer(CompletionSource::Stream, 2).adopted());
        assert!(!latch.offer(CompletionSource::Stream, 3).adopted());
        assert_eq!(latch.get(), Some(&1));
    }

    #[test]
    fn reset_reopens_the_slot() {
        let mut latch = Latch::new();
        latch.offer(CompletionSource::Request, 1);
        latch.reset();
        assert!(latch.get().is_none());
        assert!(latch.offer(CompletionSource::Stream, 2).adopted());
        assert_eq!(latch.source(), Some(CompletionSource::Stream));
    }
}
