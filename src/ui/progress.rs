//! Stage progress with CI fallback

use super::context::UiContext;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// Spinner that follows the stage currently being built.
///
/// Shows an indicatif spinner in interactive mode and one plain line per
/// stage otherwise.
pub struct StageProgress {
    bar: Option<ProgressBar>,
    started: Mutex<usize>,
}

impl StageProgress {
    pub fn new(ctx: &UiContext, label: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {prefix} {msg:.dim}  {elapsed:.dim}")
            {
                bar.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
            }
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(100));
            Some(bar)
        } else {
            println!("Building {}...", label);
            None
        };

        Self {
            bar,
            started: Mutex::new(0),
        }
    }

    /// Record that `stage` is about to be looked up or built
    pub fn on_stage(&self, stage: &str) {
        let n = match self.started.lock() {
            Ok(mut started) => {
                *started += 1;
                *started
            }
            Err(_) => 0,
        };

        match self.bar {
            Some(ref bar) => bar.set_message(format!("[{}] {}", n, stage)),
            None => println!("  [{}] {}", n, stage),
        }
    }

    /// Number of stages seen so far
    pub fn stages_seen(&self) -> usize {
        self.started.lock().map(|n| *n).unwrap_or(0)
    }

    /// Finish and clear the spinner
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}
