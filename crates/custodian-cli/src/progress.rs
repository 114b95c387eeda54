//! Run progress reporting with TTY detection, mirroring the ambient CLI's
//! fall back to plain text output when stdout is not a terminal.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

pub fn is_tty() -> bool {
    atty::is(atty::Stream::Stdout)
}

/// Reports progress across the fetch and check phases: one line (or bar
/// update) per fetcher/check key as it runs.
pub struct ProgressReporter {
    is_tty: bool,
    total: usize,
    done: usize,
    bar: Option<ProgressBar>,
    start: Instant,
}

impl ProgressReporter {
    pub fn new(total: usize) -> Self {
        let is_tty = is_tty();
        let bar = if is_tty {
            let pb = ProgressBar::new(total as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };
        Self { is_tty, total, done: 0, bar, start: Instant::now() }
    }

    pub fn silent(total: usize) -> Self {
        Self { is_tty: false, total, done: 0, bar: None, start: Instant::now() }
    }

    pub fn step(&mut self, key: &str) {
        self.done += 1;
        let elapsed = self.start.elapsed();
        let msg = format!("[{}/{}] {key} ({elapsed:?})", self.done, self.total);
        if self.is_tty {
            if let Some(pb) = &self.bar {
                pb.set_message(msg);
                pb.set_position(self.done as u64);
            }
        } else {
            eprintln!("{msg}");
        }
    }

    pub fn finish(self) {
        let elapsed = self.start.elapsed();
        if let Some(pb) = self.bar {
            pb.finish_with_message(format!("completed {} in {elapsed:?}", self.total));
        } else {
            eprintln!("completed {} in {elapsed:?}", self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_reporter_never_ticks() {
        let mut r = ProgressReporter::silent(3);
        r.step("pkg.A");
        assert_eq!(r.done, 1);
        r.finish();
    }
}
