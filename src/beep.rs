// src/beep.rs

//! Buzzer side-channel
//!
//! Deployments can take minutes; the buzzer tells an operator across the
//! room that a run started, finished, or hit a blocking error. The engine
//! only knows the [`Beeper`] seam; the console implementation maps
//! configured events to BEL characters, and `--no-beeps` swaps in the
//! silent one.

use std::collections::HashMap;
use std::io::Write;

/// Event sound hook
pub trait Beeper {
    /// Sound the pattern configured for `event`, if any
    fn beep(&self, event: &str);
}

/// Terminal-bell beeper driven by the user `beeps` map
///
/// A pattern is a comma-separated list of `freq:millis` notes; the
/// terminal bell cannot honor pitch, so each note becomes one BEL.
#[derive(Debug, Default)]
pub struct ConsoleBeeper {
    patterns: HashMap<String, String>,
}

impl ConsoleBeeper {
    pub fn new(patterns: HashMap<String, String>) -> Self {
        Self { patterns }
    }
}

impl Beeper for ConsoleBeeper {
    fn beep(&self, event: &str) {
        if let Some(pattern) = self.patterns.get(event) {
            let notes = pattern.split(',').filter(|n| !n.trim().is_empty()).count();
            let mut err = std::io::stderr();
            for _ in 0..notes.max(1) {
                let _ = err.write_all(b"\x07");
            }
            let _ = err.flush();
        }
    }
}

/// No-op beeper for `--no-beeps` and scripted use
#[derive(Debug, Default)]
pub struct SilentBeeper;

impl Beeper for SilentBeeper {
    fn beep(&self, _event: &str) {}
}
