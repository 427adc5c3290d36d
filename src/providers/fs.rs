use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use super::{DEFAULT_HISTORY_CAP, HistoryError, HistoryStore, check_append};
use crate::Event;

/// Simple filesystem-backed history store writing one JSONL file per instance.
///
/// Appends rewrite the instance file through a temp file and a rename, so a
/// concurrent reader sees either the old or the new history and never a
/// partially written event.
pub struct FsHistoryStore {
    root: PathBuf,
    cap: usize,
    // Serializes the read-check-write of appends within this process.
    write_lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        Self::new_with_cap(root, reset_on_create, DEFAULT_HISTORY_CAP)
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create; errors surface on first use
        let _ = std::fs::create_dir_all(&path);
        Self {
            root: path,
            cap,
            write_lock: Mutex::new(()),
        }
    }

    fn inst_path(&self, instance: &str) -> Result<PathBuf, HistoryError> {
        if instance.is_empty()
            || instance.starts_with('.')
            || instance.contains(['/', '\\'])
            || instance.contains("..")
        {
            return Err(HistoryError::Storage(format!("invalid instance id for fs store: {instance:?}")));
        }
        Ok(self.root.join(format!("{instance}.jsonl")))
    }

    async fn read_path(&self, instance: &str, path: &Path) -> Result<Vec<Event>, HistoryError> {
        let data = match fs::read_to_string(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HistoryError::InstanceNotFound(instance.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str::<Event>(line)?);
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), HistoryError> {
        let path = self.inst_path(instance)?;
        fs::create_dir_all(&self.root).await?;
        match fs::OpenOptions::new().create_new(true).write(true).open(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(HistoryError::InstanceExists(instance.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the entire JSONL file for the instance and deserialize each line.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, HistoryError> {
        let path = self.inst_path(instance)?;
        self.read_path(instance, &path).await
    }

    async fn append(
        &self,
        instance: &str,
        expected_len: usize,
        new_events: Vec<Event>,
    ) -> Result<usize, HistoryError> {
        let path = self.inst_path(instance)?;
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_path(instance, &path).await?;
        check_append(instance, &all, expected_len, &new_events, self.cap)?;
        all.extend(new_events);

        let mut buf = String::new();
        for ev in &all {
            buf.push_str(&serde_json::to_string(ev)?);
            buf.push('\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut tf = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .await?;
            tf.write_all(buf.as_bytes()).await?;
            tf.flush().await?;
            tf.sync_all().await?;
        }
        fs::rename(&tmp, &path).await?;
        Ok(all.len())
    }

    /// List instances by scanning `.jsonl` files under the root.
    async fn list_instances(&self) -> Result<Vec<String>, HistoryError> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(ent) = rd.next_entry().await? {
            if let Some(name) = ent.file_name().to_str()
                && let Some(stem) = name.strip_suffix(".jsonl")
            {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), HistoryError> {
        let path = self.inst_path(instance)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HistoryError::InstanceNotFound(instance.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
