//! Per-transfer progress reporting.
//!
//! Fetches and device copies report through [`TransferProgress`] so the
//! jobs never touch the terminal directly.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub trait TransferProgress: Send + Sync {
    /// A transfer identified by `key` has started; `total` is the expected
    /// byte count when the remote side announced one.
    fn begin(&self, key: &str, total: Option<u64>);
    fn advance(&self, key: &str, bytes: u64);
    fn finish(&self, key: &str, ok: bool);

    /// Run `log` with any bars hidden so log lines do not tear them.
    fn suspend(&self, log: &mut dyn FnMut()) {
        log()
    }
}

/// Discards every report. Used by tests and with `--no-progress-bar`.
#[derive(Debug, Default)]
pub struct NoProgress;

impl TransferProgress for NoProgress {
    fn begin(&self, _key: &str, _total: Option<u64>) {}
    fn advance(&self, _key: &str, _bytes: u64) {}
    fn finish(&self, _key: &str, _ok: bool) {}
}

/// One indicatif bar per in-flight transfer.
pub struct BarProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl BarProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Hidden bars are pointless work; fall back to [`NoProgress`] when the
    /// user disabled them or stdout is not a TTY.
    pub fn boxed(no_progress_bar: bool) -> Box<dyn TransferProgress> {
        if no_progress_bar || !std::io::stdout().is_terminal() {
            Box::new(NoProgress)
        } else {
            Box::new(Self::new())
        }
    }

    fn bar_for(&self, key: &str, total: Option<u64>) -> ProgressBar {
        let pb = match total {
            Some(len) => {
                let pb = ProgressBar::new(len);
                pb.set_style(
                    ProgressStyle::with_template(
                        "{msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                    )
                    .expect("valid template")
                    .progress_chars("=> "),
                );
                pb
            }
            None => {
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::with_template("{spinner} {msg:30!} {bytes}")
                        .expect("valid template"),
                );
                pb
            }
        };
        pb.set_message(key.to_string());
        self.multi.add(pb)
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferProgress for BarProgress {
    fn begin(&self, key: &str, total: Option<u64>) {
        let pb = self.bar_for(key, total);
        let replaced = self
            .bars
            .lock()
            .ok()
            .and_then(|mut bars| bars.insert(key.to_string(), pb));
        // A retry under the same key must not strand the earlier bar.
        if let Some(stale) = replaced {
            stale.finish_and_clear();
            self.multi.remove(&stale);
        }
    }

    fn advance(&self, key: &str, bytes: u64) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(pb) = bars.get(key) {
                pb.inc(bytes);
            }
        }
    }

    fn finish(&self, key: &str, ok: bool) {
        let removed = self.bars.lock().ok().and_then(|mut bars| bars.remove(key));
        if let Some(pb) = removed {
            if ok {
                pb.finish_and_clear();
            } else {
                pb.abandon_with_message(format!("{key} failed"));
            }
            self.multi.remove(&pb);
        }
    }

    fn suspend(&self, log: &mut dyn FnMut()) {
        self.multi.suspend(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_progress_tracks_and_forgets_transfers() {
        let progress = BarProgress::new();
        progress.begin("a.mp3", Some(100));
        progress.begin("b.jpeg", None);
        progress.advance("a.mp3", 40);
        progress.advance("missing", 10);
        assert_eq!(progress.bars.lock().unwrap().len(), 2);
        assert_eq!(progress.bars.lock().unwrap()["a.mp3"].position(), 40);

        progress.finish("a.mp3", true);
        progress.finish("b.jpeg", false);
        assert!(progress.bars.lock().unwrap().is_empty());
    }

    #[test]
    fn test_bar_progress_replaces_bar_with_same_key() {
        let progress = BarProgress::new();
        progress.begin("a.mp3", Some(100));
        progress.advance("a.mp3", 70);
        let first = progress.bars.lock().unwrap()["a.mp3"].clone();

        progress.begin("a.mp3", Some(100));
        assert_eq!(progress.bars.lock().unwrap().len(), 1);
        assert_eq!(progress.bars.lock().unwrap()["a.mp3"].position(), 0);
        assert!(first.is_finished());

        progress.finish("a.mp3", true);
        assert!(progress.bars.lock().unwrap().is_empty());
    }
}
