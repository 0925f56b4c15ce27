//! Cross-process story exclusivity.
//!
//! `StoryLock` holds an exclusive advisory lock on `.gantry/story.lock` for
//! as long as it lives. The file records the holding story so a refused
//! caller can say who is in the way.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::StoryError;

#[derive(Debug)]
pub struct StoryLock {
    file: File,
    path: PathBuf,
    story_id: String,
}

impl StoryLock {
    /// Take the lock for `story_id`. Fails with
    /// [`StoryError::ConcurrentStoryConflict`] if another holder exists.
    pub fn acquire(path: &Path, story_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.trim();
            return Err(StoryError::ConcurrentStoryConflict {
                active: if holder.is_empty() {
                    "<unknown>".to_string()
                } else {
                    holder.to_string()
                },
                requested: story_id.to_string(),
            }
            .into());
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(story_id.as_bytes())?;
        file.flush()?;
        tracing::debug!(story_id, path = %path.display(), "story lock acquired");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            story_id: story_id.to_string(),
        })
    }

    pub fn story_id(&self) -> &str {
        &self.story_id
    }
}

impl Drop for StoryLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release story lock");
        }
    }
}
