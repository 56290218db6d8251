use std::collections::VecDeque;

use fastchat_core::Envelope;

pub const TRANSCRIPT_MAX: usize = 50;

/// The client's local view of the conversation, independent of the relay's
/// own history cap.
#[derive(Debug, Clone)]
pub struct Transcript {
    entries: VecDeque<Envelope>,
    capacity: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::with_capacity(TRANSCRIPT_MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Discards the current contents in favour of a relay history replay.
    pub fn replace(&mut self, items: Vec<Envelope>) {
        self.entries.clear();
        let skip = items.len().saturating_sub(self.capacity);
        self.entries.extend(items.into_iter().skip(skip));
    }

    pub fn push(&mut self, envelope: Envelope) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(envelope);
    }

    pub fn entries(&self) -> Vec<Envelope> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> Envelope {
        Envelope::outgoing("peer", text, Vec::new())
    }

    #[test]
    fn replace_discards_previous_entries() {
        let mut transcript = Transcript::new();
        transcript.push(line("stale"));
        transcript.replace(vec![line("a"), line("b")]);
        transcript.push(line("c"));

        let texts = transcript
            .entries()
            .into_iter()
            .map(|e| e.text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn oldest_entries_are_evicted_past_the_cap() {
        let mut transcript = Transcript::new();
        for n in 0..(TRANSCRIPT_MAX + 5) {
            transcript.push(line(&n.to_string()));
        }
        assert_eq!(transcript.len(), TRANSCRIPT_MAX);
        assert_eq!(transcript.entries()[0].text, "5");

        transcript.replace((0..(TRANSCRIPT_MAX + 2)).map(|n| line(&n.to_string())).collect());
        assert_eq!(transcript.len(), TRANSCRIPT_MAX);
        assert_eq!(transcript.entries()[0].text, "2");
    }
}
