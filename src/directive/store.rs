//! 指令存储：<root>/<id>.md
//!
//! load / amend / create / list。amend 以 revision 做乐观并发控制：版本号比对与写盘在同一把锁内完成，
//! 落后的写入方得到 ConcurrentAmendment，不会静默合并。写盘先写临时文件再 rename。
//! 锁分两层：进程内 Mutex，加上 <root>/.<id>.lock 上的 flock（多个 conductor 进程共享同一目录）。
//! create 是唯一可能覆盖已有指令的操作，且必须携带 OperatorApproval。

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::sync::Mutex;

use crate::core::ConductorError;
use crate::directive::format;
use crate::directive::model::{Directive, Lesson, OperatorApproval, RevisionKind};

#[derive(Debug)]
pub struct DirectiveStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

fn check_id(id: &str) -> Result<(), ConductorError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConductorError::Parse(format!("invalid directive id '{}'", id)))
    }
}

/// 持有期间独占指令的锁文件；drop 关闭文件即释放 flock
struct DirectiveLock {
    _file: File,
}

impl DirectiveStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.md", id))
    }

    pub async fn load(&self, id: &str) -> Result<Directive, ConductorError> {
        check_id(id)?;
        let path = self.path_for(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConductorError::DirectiveNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let directive = format::parse(&text)?;
        if directive.id != id {
            return Err(ConductorError::Parse(format!(
                "{} declares id '{}'",
                path.display(),
                directive.id
            )));
        }
        Ok(directive)
    }

    /// 追加一条 Lesson；base_revision 为调用方加载时看到的版本号
    pub async fn amend(
        &self,
        id: &str,
        base_revision: u64,
        lesson: &Lesson,
    ) -> Result<Directive, ConductorError> {
        check_id(id)?;
        let _guard = self.write_lock.lock().await;
        let _lock = self.lock_exclusive(id).await?;
        let mut directive = self.load(id).await?;
        if directive.revision != base_revision {
            return Err(ConductorError::ConcurrentAmendment {
                id: id.to_string(),
                expected: base_revision,
                found: directive.revision,
            });
        }
        directive.apply_lesson(lesson);
        self.write(&directive).await?;
        tracing::info!(
            directive = %id,
            revision = directive.revision,
            kind = lesson.kind.as_str(),
            tool = %lesson.tool,
            "directive amended"
        );
        Ok(directive)
    }

    /// 创建指令；已存在时需 OperatorApproval，覆盖时保留原修订日志并追加 operator_edit
    pub async fn create(
        &self,
        draft: Directive,
        overwrite: Option<OperatorApproval>,
    ) -> Result<Directive, ConductorError> {
        check_id(&draft.id)?;
        let _guard = self.write_lock.lock().await;
        let _lock = self.lock_exclusive(&draft.id).await?;
        let existing = match self.load(&draft.id).await {
            Ok(d) => Some(d),
            Err(ConductorError::DirectiveNotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let mut directive = draft;
        match (existing, overwrite) {
            (None, approval) => {
                directive.revision = 0;
                directive.history.clear();
                let by = approval
                    .map(|a| a.operator)
                    .unwrap_or_else(|| "operator".to_string());
                directive.push_revision(RevisionKind::Created, format!("created by {}", by));
            }
            (Some(previous), Some(approval)) => {
                directive.revision = previous.revision;
                directive.history = previous.history;
                directive.push_revision(
                    RevisionKind::OperatorEdit,
                    format!("rewritten by {}", approval.operator),
                );
                tracing::warn!(directive = %directive.id, operator = %approval.operator, "directive overwritten");
            }
            (Some(_), None) => return Err(ConductorError::DirectiveExists(directive.id)),
        }
        self.write(&directive).await?;
        Ok(directive)
    }

    pub async fn list(&self) -> Result<Vec<String>, ConductorError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn lock_exclusive(&self, id: &str) -> Result<DirectiveLock, ConductorError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(format!(".{}.lock", id));
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        Ok(DirectiveLock { _file: file })
    }

    async fn write(&self, directive: &Directive) -> Result<(), ConductorError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(&directive.id);
        let tmp = path.with_extension("md.tmp");
        tokio::fs::write(&tmp, format::render(directive)).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
