//! Per-turn voice selection

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::Deserialize;

use crate::{Error, Result};

/// How the roster picks a voice for each turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSelection {
    /// Always the first voice
    Fixed,
    /// Cycle through voices in order
    #[default]
    RoundRobin,
    /// Uniformly random voice each turn
    Random,
}

/// Voices available to speak replies
#[derive(Debug)]
pub struct AgentRoster {
    voices: Vec<String>,
    selection: AgentSelection,
    next: AtomicUsize,
}

impl AgentRoster {
    /// Create a roster
    ///
    /// # Errors
    ///
    /// Returns error if no voices are configured
    pub fn new(voices: Vec<String>, selection: AgentSelection) -> Result<Self> {
        if voices.is_empty() {
            return Err(Error::Config("at least one speech voice required".to_string()));
        }

        Ok(Self {
            voices,
            selection,
            next: AtomicUsize::new(0),
        })
    }

    /// Pick the voice for the next turn
    #[must_use]
    pub fn pick(&self) -> &str {
        let index = match self.selection {
            AgentSelection::Fixed => 0,
            AgentSelection::RoundRobin => {
                self.next.fetch_add(1, Ordering::Relaxed) % self.voices.len()
            }
            AgentSelection::Random => rand::thread_rng().gen_range(0..self.voices.len()),
        };
        &self.voices[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voices() -> Vec<String> {
        vec!["rachel".to_string(), "domi".to_string(), "bella".to_string()]
    }

    #[test]
    fn empty_roster_rejected() {
        assert!(AgentRoster::new(Vec::new(), AgentSelection::Fixed).is_err());
    }

    #[test]
    fn fixed_always_first() {
        let roster = AgentRoster::new(voices(), AgentSelection::Fixed).unwrap();
        assert_eq!(roster.pick(), "rachel");
        assert_eq!(roster.pick(), "rachel");
    }

    #[test]
    fn round_robin_cycles() {
        let roster = AgentRoster::new(voices(), AgentSelection::RoundRobin).unwrap();
        let picked: Vec<&str> = (0..4).map(|_| roster.pick()).collect();
        assert_eq!(picked, vec!["rachel", "domi", "bella", "rachel"]);
    }

    #[test]
    fn random_stays_in_roster() {
        let roster = AgentRoster::new(voices(), AgentSelection::Random).unwrap();
        for _ in 0..20 {
            assert!(voices().iter().any(|v| v == roster.pick()));
        }
    }
}
