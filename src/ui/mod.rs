//! Terminal output helpers
//!
//! Spinners and colored markers are used only on an interactive terminal.
//! In CI or when output is piped, everything degrades to plain lines.

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{key_value, section, step_info, step_ok, step_ok_detail, step_warn_hint};
pub use progress::StageProgress;
