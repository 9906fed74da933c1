//! Build timing utilities.

use std::time::{Duration, Instant};

/// A simple timer for measuring stage durations.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Start a new timer with the given phase name.
    pub fn start(name: &str) -> Self {
        Self {
            name: name.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the timer and log the elapsed time.
    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::info!("[{}] {}", format_duration(elapsed), self.name);
        elapsed
    }
}

/// Seconds below a minute, minutes above.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}
