//! Turn boundary heuristics
//!
//! A turn ends when the transcript looks finished. "Looks finished" is a
//! heuristic built from the service's final flag and sentence-terminal
//! punctuation; it has known failure modes:
//!
//! - abbreviations such as "Mr." end a turn early
//! - unpunctuated speech never ends a turn under the punctuation policies
//!   unless a silence timeout is configured
//!
//! The tests at the bottom pin these down.

use serde::Deserialize;

use crate::stt::TranscriptFragment;

/// Characters that end a sentence by default
pub const DEFAULT_TERMINALS: [char; 3] = ['.', '?', '!'];

/// Closing characters skipped when looking for terminal punctuation
const CLOSERS: [char; 5] = ['"', '\'', ')', '\u{201d}', '\u{2019}'];

/// Which signals mark the end of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Transcript ends with a sentence-terminal character
    Punctuation,
    /// The service marked the fragment final
    Final,
    /// Both of the above
    #[default]
    FinalPunctuation,
}

/// Decides whether a fragment closes the current turn
#[derive(Debug, Clone)]
pub struct TurnDetector {
    policy: BoundaryPolicy,
    terminals: Vec<char>,
}

impl Default for TurnDetector {
    fn default() -> Self {
        Self::new(BoundaryPolicy::default(), DEFAULT_TERMINALS.to_vec())
    }
}

impl TurnDetector {
    /// Create a detector; an empty terminal set falls back to `. ? !`
    #[must_use]
    pub fn new(policy: BoundaryPolicy, terminals: Vec<char>) -> Self {
        let terminals = if terminals.is_empty() {
            DEFAULT_TERMINALS.to_vec()
        } else {
            terminals
        };
        Self { policy, terminals }
    }

    /// Whether `text` ends a sentence
    #[must_use]
    pub fn ends_sentence(&self, text: &str) -> bool {
        text.trim_end()
            .trim_end_matches(CLOSERS)
            .chars()
            .next_back()
            .is_some_and(|c| self.terminals.contains(&c))
    }

    /// Whether `fragment`, applied to `transcript`, closes the turn
    #[must_use]
    pub fn is_boundary(&self, fragment: &TranscriptFragment, transcript: &Transcript) -> bool {
        if transcript.is_empty() {
            return false;
        }

        match self.policy {
            BoundaryPolicy::Punctuation => self.ends_sentence(&transcript.text()),
            BoundaryPolicy::Final => fragment.is_final,
            BoundaryPolicy::FinalPunctuation => {
                fragment.is_final && self.ends_sentence(&transcript.text())
            }
        }
    }
}

/// Speech heard during the current turn
///
/// Final fragments are committed in order; a partial fragment replaces the
/// uncommitted tail, since services resend the whole hypothesis each time.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    committed: String,
    partial: String,
    last_final: bool,
}

impl Transcript {
    /// Fold a fragment in
    pub fn apply(&mut self, fragment: &TranscriptFragment) {
        let text = fragment.text.trim();
        self.last_final = fragment.is_final;

        if fragment.is_final {
            self.partial.clear();
            if !text.is_empty() {
                if !self.committed.is_empty() {
                    self.committed.push(' ');
                }
                self.committed.push_str(text);
            }
        } else {
            text.clone_into(&mut self.partial);
        }
    }

    /// Committed text followed by the current partial
    #[must_use]
    pub fn text(&self) -> String {
        match (self.committed.is_empty(), self.partial.is_empty()) {
            (_, true) => self.committed.clone(),
            (true, false) => self.partial.clone(),
            (false, false) => format!("{} {}", self.committed, self.partial),
        }
    }

    /// No speech heard
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.partial.is_empty()
    }

    /// The most recent fragment was final
    #[must_use]
    pub const fn ends_with_final(&self) -> bool {
        self.last_final
    }

    /// Forget everything heard
    pub fn clear(&mut self) {
        self.committed.clear();
        self.partial.clear();
        self.last_final = false;
    }
}
