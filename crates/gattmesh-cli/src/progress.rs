//! Transfer progress display.

use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar over the units of one transfer
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a tracker for `total_units` units
    #[must_use]
    pub fn new(total_units: u64, label: &str) -> Self {
        let bar = ProgressBar::new(total_units);

        let style = ProgressStyle::default_bar()
            .template(
                "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} units",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message(format!("Sending: {label}"));

        Self { bar }
    }

    /// Reset the total once the engine reports it
    pub fn set_total(&self, total_units: u64) {
        self.bar.set_length(total_units);
    }

    /// Update progress
    pub fn update(&self, done_units: u64) {
        self.bar.set_position(done_units);
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}
