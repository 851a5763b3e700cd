//! 运行归档：<runs_dir>/<run_id>.json
//!
//! 终态与挂起的 TaskRun 整份写盘，resume 时读回。

use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::core::{ConductorError, TaskRun};

#[derive(Debug, Clone)]
pub struct RunArchive {
    dir: PathBuf,
}

impl RunArchive {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub async fn save(&self, run: &TaskRun) -> Result<PathBuf, ConductorError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(run.id);
        let json = serde_json::to_string_pretty(run)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        tracing::debug!(run = %run.id, state = %run.state, path = %path.display(), "run archived");
        Ok(path)
    }

    pub async fn load(&self, id: Uuid) -> Result<TaskRun, ConductorError> {
        let path = self.path_for(id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConductorError::Parse(format!("no archived run {}", id)));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }
}
