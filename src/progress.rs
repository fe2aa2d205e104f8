use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static PROGRESS_KV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)=([\w\-\.:]+)$").unwrap());

/// Progress bar fed by ffmpeg's `-progress` key/value output. Draws to
/// stderr and stays hidden when that is not a terminal.
pub struct ProgressUi {
    bar: ProgressBar,
    total_ms: u64,
}

impl ProgressUi {
    pub fn new(total_ms: u64, label: &str) -> Self {
        let total_ms = total_ms.max(1);
        let bar = ProgressBar::new(total_ms);
        bar.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}]  [{bar:60.cyan/bright-black}] {percent:>3}%  ETA:{eta_precise}\n{wide_msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(500));
        bar.set_message(format!("Recording {label}"));
        Self { bar, total_ms }
    }

    /// Position in milliseconds, if `line` carries one.
    pub fn observe(&self, line: &str) -> Option<u64> {
        let caps = PROGRESS_KV.captures(line.trim())?;
        match &caps[1] {
            "out_time_ms" | "out_time_us" => {
                let micros: u64 = caps[2].parse().ok()?;
                let pos_ms = (micros / 1000).min(self.total_ms);
                self.bar.set_position(pos_ms);
                Some(pos_ms)
            }
            "progress" if &caps[2] == "end" => {
                self.bar.set_position(self.total_ms);
                Some(self.total_ms)
            }
            _ => None,
        }
    }

    pub fn finish(&self, ok: bool) {
        if ok {
            self.bar.finish_with_message("Done");
        } else {
            self.bar.abandon_with_message("Failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_out_time() {
        let ui = ProgressUi::new(60_000, "test");
        assert_eq!(ui.observe("out_time_ms=1500000"), Some(1_500));
        assert_eq!(ui.observe("out_time_us=90000000"), Some(60_000));
        assert_eq!(ui.observe("progress=end"), Some(60_000));
    }

    #[test]
    fn test_observe_ignores_other_keys() {
        let ui = ProgressUi::new(60_000, "test");
        assert_eq!(ui.observe("bitrate=1234.5kbits/s"), None);
        assert_eq!(ui.observe("progress=continue"), None);
        assert_eq!(ui.observe("out_time_ms=N/A"), None);
        assert_eq!(ui.observe("not a progress line"), None);
    }
}
