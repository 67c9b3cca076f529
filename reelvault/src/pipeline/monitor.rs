//! Incoming-directory monitor.
//!
//! Polls a drop directory and submits files once their size has been stable
//! across two consecutive scans. A file that reappears (or never leaves)
//! after submission is not resubmitted until a cool-down has elapsed, which
//! keeps a slow downstream from seeing the same path twice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Sizes that never indicate a finished upload: zero or one byte is a
/// placeholder, exactly 4096 bytes is a directory-sized stub some transfer
/// tools leave behind.
fn plausible_size(size: u64) -> bool {
    size > 1 && size != 4096
}

/// Per-path bookkeeping between scans. Split out from the poll loop so the
/// stability and cool-down rules can be tested without timers.
#[derive(Debug)]
struct ScanBook {
    resubmit_delay: Duration,
    /// Size each candidate had on its last scan.
    last_size: HashMap<PathBuf, u64>,
    /// When each path was last submitted downstream.
    submitted: HashMap<PathBuf, Instant>,
}

impl ScanBook {
    fn new(resubmit_delay: Duration) -> Self {
        Self {
            resubmit_delay,
            last_size: HashMap::new(),
            submitted: HashMap::new(),
        }
    }

    /// Record one observation of `path`. Returns true when the file should be
    /// submitted downstream now.
    fn observe(&mut self, path: &Path, size: u64, now: Instant) -> bool {
        if let Some(at) = self.submitted.get(path) {
            if now.duration_since(*at) < self.resubmit_delay {
                return false;
            }
            self.submitted.remove(path);
        }

        if !plausible_size(size) {
            self.last_size.remove(path);
            return false;
        }

        match self.last_size.get(path) {
            Some(prev) if *prev == size => {
                self.last_size.remove(path);
                self.submitted.insert(path.to_path_buf(), now);
                true
            }
            _ => {
                self.last_size.insert(path.to_path_buf(), size);
                false
            }
        }
    }

    /// Drop state for paths no longer present in the directory, and expired
    /// cool-down entries. A vanished path costs nothing to forget; if it
    /// comes back it simply starts a fresh stability cycle.
    fn retain_seen(&mut self, seen: &HashMap<PathBuf, u64>, now: Instant) {
        self.last_size.retain(|path, _| seen.contains_key(path));
        let delay = self.resubmit_delay;
        self.submitted
            .retain(|path, at| seen.contains_key(path) && now.duration_since(*at) < delay);
    }
}

/// Polls the incoming directory and feeds stable files to the dispatcher.
pub struct IncomingMonitor {
    incoming_dir: PathBuf,
    poll_interval: Duration,
    tx: mpsc::UnboundedSender<PathBuf>,
    token: CancellationToken,
    book: ScanBook,
}

impl IncomingMonitor {
    pub fn new(
        incoming_dir: PathBuf,
        poll_interval: Duration,
        resubmit_delay: Duration,
        tx: mpsc::UnboundedSender<PathBuf>,
        token: CancellationToken,
    ) -> Self {
        Self {
            incoming_dir,
            poll_interval,
            tx,
            token,
            book: ScanBook::new(resubmit_delay),
        }
    }

    /// Run until cancelled. An unreadable incoming directory is fatal; losing
    /// it means silently ingesting nothing, which must not look like an idle
    /// system.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(dir = %self.incoming_dir.display(), "watching incoming directory");

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    tracing::debug!("incoming monitor stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            self.scan()?;
        }
    }

    fn scan(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.incoming_dir).map_err(|e| {
            Error::other(format!(
                "cannot read incoming directory '{}': {e}",
                self.incoming_dir.display()
            ))
        })?;

        let mut seen: HashMap<PathBuf, u64> = HashMap::new();
        for entry in entries {
            // A file may vanish between listing and stat; just skip it.
            let Ok(entry) = entry else { continue };
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_file() {
                seen.insert(entry.path(), meta.len());
            }
        }

        let now = Instant::now();
        for (path, size) in &seen {
            if self.book.observe(path, *size, now) {
                tracing::info!(file = %path.display(), size, "submitting stable file");
                if self.tx.send(path.clone()).is_err() {
                    return Err(Error::other("dispatcher channel closed"));
                }
            }
        }
        self.book.retain_seen(&seen, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(entries: &[(&str, u64)]) -> HashMap<PathBuf, u64> {
        entries
            .iter()
            .map(|(p, s)| (PathBuf::from(p), *s))
            .collect()
    }

    #[test]
    fn submits_only_after_stable_size() {
        let mut book = ScanBook::new(Duration::from_secs(15));
        let now = Instant::now();
        let path = Path::new("/in/clip.mp4");

        assert!(!book.observe(path, 100, now));
        assert!(!book.observe(path, 200, now)); // still growing
        assert!(book.observe(path, 200, now)); // stable across two scans
    }

    #[test]
    fn implausible_sizes_never_submit() {
        let mut book = ScanBook::new(Duration::from_secs(15));
        let now = Instant::now();
        let path = Path::new("/in/clip.mp4");

        assert!(!book.observe(path, 0, now));
        assert!(!book.observe(path, 0, now));
        assert!(!book.observe(path, 1, now));
        assert!(!book.observe(path, 1, now));
        assert!(!book.observe(path, 4096, now));
        assert!(!book.observe(path, 4096, now));
    }

    #[test]
    fn implausible_size_resets_stability() {
        let mut book = ScanBook::new(Duration::from_secs(15));
        let now = Instant::now();
        let path = Path::new("/in/clip.mp4");

        assert!(!book.observe(path, 500, now));
        assert!(!book.observe(path, 0, now)); // truncated mid-transfer
        assert!(!book.observe(path, 500, now)); // must stabilize again
        assert!(book.observe(path, 500, now));
    }

    #[test]
    fn no_resubmission_within_cooldown() {
        let mut book = ScanBook::new(Duration::from_secs(15));
        let t0 = Instant::now();
        let path = Path::new("/in/clip.mp4");

        assert!(!book.observe(path, 500, t0));
        assert!(book.observe(path, 500, t0));

        // The file stays in place (downstream is slow to move it).
        let t1 = t0 + Duration::from_secs(5);
        assert!(!book.observe(path, 500, t1));
        assert!(!book.observe(path, 500, t1));
    }

    #[test]
    fn resubmits_after_cooldown() {
        let mut book = ScanBook::new(Duration::from_secs(15));
        let t0 = Instant::now();
        let path = Path::new("/in/clip.mp4");

        assert!(!book.observe(path, 500, t0));
        assert!(book.observe(path, 500, t0));

        let t1 = t0 + Duration::from_secs(20);
        assert!(!book.observe(path, 500, t1)); // fresh stability cycle
        assert!(book.observe(path, 500, t1));
    }

    #[test]
    fn vanished_paths_are_forgotten() {
        let mut book = ScanBook::new(Duration::from_secs(15));
        let t0 = Instant::now();
        let path = Path::new("/in/clip.mp4");

        assert!(!book.observe(path, 500, t0));
        book.retain_seen(&seen(&[]), t0); // file picked up by downstream

        // It reappears: starts over instead of submitting immediately.
        assert!(!book.observe(path, 500, t0 + Duration::from_secs(1)));
        assert!(book.observe(path, 500, t0 + Duration::from_secs(2)));
    }
}
