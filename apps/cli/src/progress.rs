//! Progress bar rendering for CLI downloads

use console::style;
use downkit_core::{DownloadTask, EngineError, ProgressSink};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

/// Renders one progress bar per active task, keyed by task id.
pub struct ProgressRenderer {
    multi: MultiProgress,
    bars: Mutex<HashMap<u64, ProgressBar>>,
}

impl ProgressRenderer {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_for(&self, task: &DownloadTask) -> ProgressBar {
        let mut bars = self.bars.lock();
        bars.entry(task.id())
            .or_insert_with(|| {
                let pb = self.multi.add(ProgressBar::new(task.total_length()));
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                        .unwrap()
                        .progress_chars("█▓▒░  "),
                );
                pb.set_message(short_name(&task.url()));
                pb
            })
            .clone()
    }
}

impl Default for ProgressRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressRenderer {
    fn on_start(&self, task: &DownloadTask) {
        self.bar_for(task);
    }

    fn on_progress(&self, task: &DownloadTask, downloaded: u64, total: Option<u64>) {
        let pb = self.bar_for(task);
        if let Some(total) = total {
            pb.set_length(total);
        }
        pb.set_position(downloaded);
    }

    fn on_complete(&self, task: &DownloadTask, target: &Path) {
        let pb = self.bar_for(task);
        pb.finish_with_message(format!(
            "{} {}",
            style("✓").green().bold(),
            target.display()
        ));
    }

    fn on_error(&self, task: &DownloadTask, error: &EngineError) {
        let pb = self.bar_for(task);
        pb.abandon_with_message(format!("{} {}", style("✗").red().bold(), error));
    }
}

fn short_name(url: &str) -> String {
    url.split('?')
        .next()
        .and_then(|tail| tail.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("download")
        .to_string()
}
