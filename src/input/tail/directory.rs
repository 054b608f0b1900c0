use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

use super::{watch_dir, DirectorySettings, LineSink, TailFollower, TailSettings};
use crate::{
    event::model::Meta,
    input::runtime::{stopped, RuntimeHandle},
};

/// Keeps one [`TailFollower`] per matching file in a directory.
pub struct DirectoryFollower {
    dir: PathBuf,
    file_settings: TailSettings,
    settings: DirectorySettings,
    sink: LineSink,
    children: HashMap<PathBuf, RuntimeHandle>,
    scanned_once: bool,
}

impl DirectoryFollower {
    pub fn new(
        dir: PathBuf,
        file_settings: TailSettings,
        settings: DirectorySettings,
        sink: LineSink,
    ) -> Self {
        // Children are keyed by absolute path whatever form `dir` was configured in.
        let dir = std::path::absolute(&dir).unwrap_or_else(|e| {
            warn!("Tail dir {} not absolutized: {}", dir.display(), e);
            dir
        });
        Self {
            dir,
            file_settings,
            settings,
            sink,
            children: HashMap::new(),
            scanned_once: false,
        }
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!("Tail multi start dir={}", self.dir.display());
        self.scan().await;

        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        let _watcher = if self.file_settings.watch {
            watch_dir(&self.dir, None, watch_tx.clone())
        } else {
            None
        };
        let interval = self.settings.scan_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan().await,
                Some(_) = watch_rx.recv() => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.scan_debounce) => {}
                        _ = stopped(&mut stop) => break,
                    }
                    while watch_rx.try_recv().is_ok() {}
                    self.scan().await;
                }
                _ = stopped(&mut stop) => break,
            }
        }

        drop(watch_tx);
        for (path, child) in self.children.drain() {
            debug!("Tail detach file={}", path.display());
            child.stop();
        }
        info!("Tail multi stop dir={}", self.dir.display());
    }

    async fn wanted(&self) -> std::io::Result<HashSet<PathBuf>> {
        let mut wanted = HashSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_file = entry
                .file_type()
                .await
                .map(|kind| kind.is_file() || kind.is_symlink())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            let name = entry.file_name();
            if self.settings.accepts(&name.to_string_lossy()) {
                wanted.insert(entry.path());
            }
        }
        Ok(wanted)
    }

    async fn scan(&mut self) {
        let wanted = match self.wanted().await {
            Ok(wanted) => wanted,
            Err(e) => {
                warn!("Tail scan error dir={}: {}", self.dir.display(), e);
                return;
            }
        };
        if wanted.is_empty() {
            debug!("Tail scan dir={} matched=0", self.dir.display());
        }

        // Files that show up after the first scan are new, so read them whole.
        let start_at_end = !self.scanned_once && self.file_settings.start_at_end;
        self.scanned_once = true;

        let mut fresh: Vec<PathBuf> = wanted
            .iter()
            .filter(|path| !self.children.contains_key(*path))
            .cloned()
            .collect();
        fresh.sort();
        for path in fresh {
            info!("Tail attach file={}", path.display());
            let child = self.attach(path.clone(), start_at_end);
            self.children.insert(path, child);
        }

        let gone: Vec<PathBuf> = self
            .children
            .keys()
            .filter(|path| !wanted.contains(*path))
            .cloned()
            .collect();
        for path in gone {
            if let Some(child) = self.children.remove(&path) {
                info!("Tail detach file={}", path.display());
                child.stop();
            }
        }
    }

    fn attach(&self, path: PathBuf, start_at_end: bool) -> RuntimeHandle {
        let settings = TailSettings {
            start_at_end,
            ..self.file_settings.clone()
        };
        let dir = Value::String(self.dir.display().to_string());
        let file = Value::String(
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        let parent_sink = self.sink.clone();
        let sink: LineSink = Arc::new(move |payload: Value, mut meta: Meta| {
            meta.insert("dir".to_string(), dir.clone());
            meta.insert("file".to_string(), file.clone());
            parent_sink(payload, meta);
        });
        let follower = TailFollower::new(path, settings, sink);
        RuntimeHandle::spawn(move |stop| follower.run(stop))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn followed(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.children.keys().cloned().collect();
        paths.sort();
        paths
    }
}
