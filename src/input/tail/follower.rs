use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::{mpsc, watch},
};
use tracing::{debug, info, trace, warn};

use super::{watch_dir, LineSink, TailSettings, WatchSignal};
use crate::{event::model::Meta, input::runtime::stopped};

const CHUNK_SIZE: usize = 64 * 1024;

/// Follows one file. Offset, inode and the partial-line remainder belong to this
/// follower alone.
pub struct TailFollower {
    path: PathBuf,
    settings: TailSettings,
    sink: LineSink,
    file: Option<File>,
    inode: Option<u64>,
    offset: u64,
    carry: Vec<u8>,
    backoff: Duration,
}

impl TailFollower {
    pub fn new(path: PathBuf, settings: TailSettings, sink: LineSink) -> Self {
        let backoff = settings.poll_interval;
        Self {
            path,
            settings,
            sink,
            file: None,
            inode: None,
            offset: 0,
            carry: Vec::new(),
            backoff,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!("Tail start path={}", self.path.display());
        self.open(true).await;

        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        let _watcher = if self.settings.watch {
            let dir = self
                .path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            watch_dir(dir, self.path.file_name().map(|n| n.to_os_string()), watch_tx.clone())
        } else {
            None
        };

        loop {
            if *stop.borrow() {
                break;
            }
            let progressed = self.poll().await;
            self.backoff = if progressed {
                self.settings.poll_interval
            } else {
                (self.backoff * 2).min(self.settings.max_backoff)
            };
            tokio::select! {
                _ = tokio::time::sleep(self.backoff) => {}
                signal = watch_rx.recv() => {
                    if signal == Some(WatchSignal::Failed) {
                        debug!("Tail watch error, resyncing {}", self.path.display());
                        self.file = None;
                    }
                    self.backoff = self.settings.poll_interval;
                }
                _ = stopped(&mut stop) => break,
            }
        }
        // The sender lives until here so `recv` never resolves to None mid-loop.
        drop(watch_tx);
        info!("Tail stop path={}", self.path.display());
    }

    /// Opens the path. The first open honours `from`; later opens keep the offset when
    /// the file is the same one, and start from 0 for a new or shrunk file.
    async fn open(&mut self, initial: bool) -> bool {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) => {
                trace!("Tail open failed {}: {}", self.path.display(), e);
                return false;
            }
        };
        let metadata = match file.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Tail stat failed {}: {}", self.path.display(), e);
                return false;
            }
        };
        let inode = inode_of(&metadata);
        if initial {
            self.offset = if self.settings.start_at_end {
                metadata.len()
            } else {
                0
            };
        } else if self.inode != Some(inode) || metadata.len() < self.offset {
            self.offset = 0;
            self.carry.clear();
        }
        debug!(
            "Tail opened file={} size={} inode={} offset={}",
            self.path.display(),
            metadata.len(),
            inode,
            self.offset
        );
        self.inode = Some(inode);
        self.file = Some(file);
        true
    }

    /// One poll cycle. Returns whether any bytes were consumed.
    async fn poll(&mut self) -> bool {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(_) => return false,
        };

        let mut progressed = false;
        if self.file.is_some() && self.inode.is_some_and(|inode| inode != inode_of(&metadata)) {
            info!("Tail rotation detected path={}", self.path.display());
            progressed |= self.drain_current().await;
            self.file = None;
            self.carry.clear();
        }

        if self.file.is_none() && !self.open(false).await {
            return progressed;
        }

        let size = metadata.len();
        if size < self.offset {
            debug!("Tail truncation detected path={}", self.path.display());
            self.offset = 0;
            self.carry.clear();
        }
        if size > self.offset {
            match self.read_range(size).await {
                Ok(read) => progressed |= read > 0,
                Err(e) => {
                    warn!("Tail read error path={}: {}", self.path.display(), e);
                    self.file = None;
                }
            }
        }
        progressed
    }

    /// Reads whatever is left in the handle we hold, before switching to a new file.
    async fn drain_current(&mut self) -> bool {
        let Some(file) = &self.file else {
            return false;
        };
        let Ok(metadata) = file.metadata().await else {
            return false;
        };
        let size = metadata.len();
        if size <= self.offset {
            return false;
        }
        matches!(self.read_range(size).await, Ok(read) if read > 0)
    }

    async fn read_range(&mut self, end: u64) -> std::io::Result<u64> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        file.seek(SeekFrom::Start(self.offset)).await?;
        let wanted = end - self.offset;
        let mut total = 0u64;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        while total < wanted {
            let len = (wanted - total).min(CHUNK_SIZE as u64) as usize;
            let read = file.read(&mut chunk[..len]).await?;
            if read == 0 {
                break;
            }
            total += read as u64;
            self.carry.extend_from_slice(&chunk[..read]);
        }
        self.offset += total;
        self.flush_lines();
        Ok(total)
    }

    fn flush_lines(&mut self) {
        while let Some(pos) = self.carry.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.carry.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            let payload = self.settings.codec.decode(&line);
            let mut meta = Meta::new();
            meta.insert(
                "path".to_string(),
                Value::String(self.path.display().to_string()),
            );
            (self.sink)(payload, meta);
        }
    }
}

#[cfg(unix)]
fn inode_of(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode_of(_metadata: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{guard::lock, input::codec::Codec};
    use serde_json::json;
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };

    fn settings(start_at_end: bool) -> TailSettings {
        TailSettings {
            codec: Codec::Utf8,
            poll_interval: Duration::from_millis(20),
            max_backoff: Duration::from_millis(40),
            start_at_end,
            watch: false,
        }
    }

    fn collecting_sink() -> (Arc<Mutex<Vec<Value>>>, LineSink) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = lines.clone();
        let sink: LineSink = Arc::new(move |payload: Value, _meta: Meta| lock(&sink_lines).push(payload));
        (lines, sink)
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_poll_reads_appended_lines_with_carry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "old line\n");
        let (lines, sink) = collecting_sink();
        let mut follower = TailFollower::new(path.clone(), settings(true), sink);

        assert!(follower.open(true).await);
        append(&path, "first\r\nsec");
        assert!(follower.poll().await);
        append(&path, "ond\n\n");
        assert!(follower.poll().await);
        assert!(!follower.poll().await);

        assert_eq!(*lock(&lines), vec![json!("first"), json!("second")]);
    }

    #[tokio::test]
    async fn test_from_start_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a\nb\n");
        let (lines, sink) = collecting_sink();
        let mut follower = TailFollower::new(path.clone(), settings(false), sink);

        follower.open(true).await;
        follower.poll().await;
        std::fs::write(&path, "c\n").unwrap();
        follower.poll().await;

        assert_eq!(*lock(&lines), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_missing_file_is_picked_up_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.log");
        let (lines, sink) = collecting_sink();
        let mut follower = TailFollower::new(path.clone(), settings(true), sink);

        assert!(!follower.open(true).await);
        assert!(!follower.poll().await);
        append(&path, "hello\n");
        assert!(follower.poll().await);

        assert_eq!(*lock(&lines), vec![json!("hello")]);
    }
}
