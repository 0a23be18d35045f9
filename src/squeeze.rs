//! Double-squeeze gesture detection over a stream of force readings.

use crate::types::SqueezeThreshold;
use std::time::Duration;
use tokio::time::Instant;

/// Default window within which a gesture must complete
pub const DEFAULT_SQUEEZE_WINDOW: Duration = Duration::from_secs(5);

/// Progress through a double-squeeze gesture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqueezePhase {
    /// Waiting for the first press
    #[default]
    Initial,
    /// First press is held
    FirstPressed,
    /// First press was released
    FirstPressCompleted,
    /// Second press is held
    SecondPressed,
}

/// Edge reported for a single force reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqueezeSignal {
    /// Reading at or above the pressed threshold
    Pressed,
    /// Release of a held press
    Depressed,
    /// Second release completed the gesture
    DoubleSqueeze,
}

/// Timed state machine recognising two press/release cycles
///
/// The detector has no timer of its own. Each pressed edge moves the
/// deadline to `now + window`; the owner calls [`SqueezeDetector::expire`]
/// when the deadline passes. Readings arriving after the deadline also
/// observe the reset.
#[derive(Debug, Clone)]
pub struct SqueezeDetector {
    threshold: SqueezeThreshold,
    window: Duration,
    phase: SqueezePhase,
    deadline: Option<Instant>,
}

impl Default for SqueezeDetector {
    fn default() -> Self {
        Self::new(SqueezeThreshold::default(), DEFAULT_SQUEEZE_WINDOW)
    }
}

impl SqueezeDetector {
    /// Create a detector in the initial phase
    #[must_use]
    pub const fn new(threshold: SqueezeThreshold, window: Duration) -> Self {
        Self {
            threshold,
            window,
            phase: SqueezePhase::Initial,
            deadline: None,
        }
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> SqueezePhase {
        self.phase
    }

    /// Pending reset deadline
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Replace the thresholds without touching the current phase
    pub fn set_threshold(&mut self, threshold: SqueezeThreshold) {
        self.threshold = threshold;
    }

    /// Replace the gesture window; applies from the next pressed edge
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Feed one force reading
    pub fn evaluate(&mut self, force: f64, now: Instant) -> Vec<SqueezeSignal> {
        self.expire(now);

        let mut signals = Vec::new();
        if force >= self.threshold.pressed {
            signals.push(SqueezeSignal::Pressed);
            self.phase = match self.phase {
                SqueezePhase::Initial => SqueezePhase::FirstPressed,
                SqueezePhase::FirstPressCompleted => SqueezePhase::SecondPressed,
                held => held,
            };
            self.deadline = Some(now + self.window);
        } else if force <= self.threshold.depressed {
            match self.phase {
                SqueezePhase::FirstPressed => {
                    signals.push(SqueezeSignal::Depressed);
                    self.phase = SqueezePhase::FirstPressCompleted;
                }
                SqueezePhase::SecondPressed => {
                    signals.push(SqueezeSignal::Depressed);
                    signals.push(SqueezeSignal::DoubleSqueeze);
                    self.reset();
                }
                SqueezePhase::Initial | SqueezePhase::FirstPressCompleted => {}
            }
        }
        signals
    }

    /// Return to the initial phase if the deadline has passed
    ///
    /// Returns `true` when a reset happened.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Drop any gesture in progress
    pub fn reset(&mut self) {
        self.phase = SqueezePhase::Initial;
        self.deadline = None;
    }
}
