//! # Tail Inputs
//!
//! Follows a single file, or in directory mode a changing set of files, and emits one
//! event per complete line.
//!
//! ```text
//!  poll (size) ──▶ truncated? ──▶ offset = 0
//!       │          rotated?   ──▶ drain old handle, reopen at 0
//!       │          grown?     ──▶ read [offset, size) ──▶ split '\n' ──▶ emit
//!       ▼
//!  idle: backoff ×2 (capped)     fs notification: re-poll now
//! ```
//!
//! I/O errors are logged and retried on the next cycle; they never end the runtime.

pub mod directory;
pub mod follower;

use std::{path::Path, sync::Arc, time::Duration};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use super::{
    codec::Codec,
    definition::{TailFrom, TailInputConfig},
    runtime::Emitter,
};
use crate::event::model::Meta;

pub use directory::DirectoryFollower;
pub use follower::TailFollower;

const DEFAULT_POLL_MS: u64 = 1000;
const MIN_BACKOFF_MS: u64 = 2000;
const MIN_SCAN_MS: u64 = 500;
const DEFAULT_SCAN_DEBOUNCE_MS: u64 = 150;
const DEFAULT_IGNORE: &str = r"\.old$";

/// Receives each decoded line with its meta.
pub type LineSink = Arc<dyn Fn(Value, Meta) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct TailSettings {
    pub codec: Codec,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub start_at_end: bool,
    pub watch: bool,
}

impl TailSettings {
    pub fn from_config(config: &TailInputConfig) -> Self {
        let poll_ms = config.poll_interval_ms.filter(|ms| *ms > 0).unwrap_or(DEFAULT_POLL_MS);
        let max_backoff_ms = config
            .max_backoff_ms
            .unwrap_or_else(|| (poll_ms * 4).max(MIN_BACKOFF_MS))
            .max(poll_ms);
        Self {
            codec: config.codec,
            poll_interval: Duration::from_millis(poll_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
            start_at_end: config.from == TailFrom::End,
            watch: config.watch,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectorySettings {
    pub patterns: Vec<Regex>,
    pub ignore: Vec<Regex>,
    pub scan_interval: Duration,
    pub scan_debounce: Duration,
}

impl DirectorySettings {
    pub fn from_config(config: &TailInputConfig) -> Self {
        let poll_ms = config.poll_interval_ms.unwrap_or(DEFAULT_POLL_MS);
        let ignore = match &config.ignore_patterns {
            Some(list) if !list.is_empty() => compile_patterns(list),
            _ => compile_patterns(&[DEFAULT_IGNORE.to_string()]),
        };
        Self {
            patterns: compile_patterns(&config.patterns),
            ignore,
            scan_interval: Duration::from_millis(
                config
                    .scan_interval_ms
                    .filter(|ms| *ms > 0)
                    .unwrap_or_else(|| poll_ms.max(MIN_SCAN_MS)),
            ),
            scan_debounce: Duration::from_millis(
                config.scan_debounce_ms.unwrap_or(DEFAULT_SCAN_DEBOUNCE_MS),
            ),
        }
    }

    /// Empty `patterns` matches every name; `ignore` always wins.
    pub fn accepts(&self, file_name: &str) -> bool {
        let included =
            self.patterns.is_empty() || self.patterns.iter().any(|p| p.is_match(file_name));
        included && !self.ignore.iter().any(|p| p.is_match(file_name))
    }
}

fn compile_patterns(sources: &[String]) -> Vec<Regex> {
    sources
        .iter()
        .filter_map(|source| match Regex::new(source) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Skipping invalid tail pattern {}: {}", source, e);
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchSignal {
    Changed,
    Failed,
}

/// Watches `dir` non-recursively. With `only`, notifications for other file names are
/// ignored. Returns `None` (polling only) when the platform watcher is unavailable.
pub(crate) fn watch_dir(
    dir: &Path,
    only: Option<std::ffi::OsString>,
    tx: mpsc::UnboundedSender<WatchSignal>,
) -> Option<RecommendedWatcher> {
    let handler = move |result: notify::Result<notify::Event>| {
        let signal = match result {
            Ok(event) => {
                let relevant = match &only {
                    None => true,
                    Some(name) => event
                        .paths
                        .iter()
                        .any(|path| path.file_name() == Some(name.as_os_str())),
                };
                if !relevant {
                    return;
                }
                WatchSignal::Changed
            }
            Err(_) => WatchSignal::Failed,
        };
        let _ = tx.send(signal);
    };
    let mut watcher = match notify::recommended_watcher(handler) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!("File watcher unavailable for {}: {}", dir.display(), e);
            return None;
        }
    };
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!("Cannot watch {}: {}", dir.display(), e);
        return None;
    }
    Some(watcher)
}

/// Entry point used by the input manager.
pub async fn run(config: TailInputConfig, emitter: Emitter, stop: watch::Receiver<bool>) {
    let sink: LineSink = Arc::new(move |payload: Value, meta: Meta| {
        emitter.emit(payload, meta);
    });
    let settings = TailSettings::from_config(&config);
    if let Some(dir) = config.dir.clone() {
        let directory = DirectorySettings::from_config(&config);
        DirectoryFollower::new(dir, settings, directory, sink)
            .run(stop)
            .await;
    } else if let Some(path) = config.path.clone() {
        TailFollower::new(path, settings, sink).run(stop).await;
    }
}
