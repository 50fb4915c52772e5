//! Filesystem commands
//!
//! Every reversible command takes a backup before mutating anything it did
//! not create, so undo can restore the exact prior state. Backups live in
//! the processor's backup directory, outside staging and study folders.

use super::{Command, ProcessorContext};
use async_trait::async_trait;
use mira_common::{Error, InstanceDocument, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

async fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(source, dest).await?;
    Ok(())
}

/// Create a directory (and missing parents). Undo removes the leaf only if
/// this command created it and it is still empty.
pub struct CreateDirectoryCommand {
    path: PathBuf,
    created: bool,
}

impl CreateDirectoryCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: false,
        }
    }
}

#[async_trait]
impl Command for CreateDirectoryCommand {
    fn describe(&self) -> String {
        format!("Create directory {}", self.path.display())
    }

    async fn execute(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.path).await?;
        self.created = true;
        Ok(())
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        if self.created {
            if let Err(e) = tokio::fs::remove_dir(&self.path).await {
                warn!(dir = %self.path.display(), error = %e, "Could not remove created directory");
            }
        }
        Ok(())
    }
}

/// Write an instance document to a target path. An existing file is backed
/// up first (or the command fails, when `fail_if_exists` is set). Undo
/// removes the written file and restores the backup.
pub struct SaveInstanceCommand {
    document: InstanceDocument,
    path: PathBuf,
    fail_if_exists: bool,
    backup: Option<PathBuf>,
    written: bool,
}

impl SaveInstanceCommand {
    pub fn new(document: InstanceDocument, path: impl Into<PathBuf>, fail_if_exists: bool) -> Self {
        Self {
            document,
            path: path.into(),
            fail_if_exists,
            backup: None,
            written: false,
        }
    }
}

#[async_trait]
impl Command for SaveInstanceCommand {
    fn describe(&self) -> String {
        format!("Save instance to {}", self.path.display())
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await? {
            if self.fail_if_exists {
                return Err(Error::Internal(format!(
                    "File already exists: {}",
                    self.path.display()
                )));
            }
            let backup = ctx.backup_path().await?;
            copy_file(&self.path, &backup).await?;
            self.backup = Some(backup);
        }

        self.document.save(&self.path).await?;
        self.written = true;
        Ok(())
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        if !self.written {
            return Ok(());
        }
        tokio::fs::remove_file(&self.path).await?;
        if let Some(backup) = &self.backup {
            copy_file(backup, &self.path).await?;
        }
        Ok(())
    }
}

/// Move a file. Any overwritten destination is backed up; undo restores
/// both sides.
pub struct MoveInstanceCommand {
    source: PathBuf,
    dest: PathBuf,
    backup: Option<PathBuf>,
    moved: bool,
}

impl MoveInstanceCommand {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            backup: None,
            moved: false,
        }
    }
}

#[async_trait]
impl Command for MoveInstanceCommand {
    fn describe(&self) -> String {
        format!(
            "Move {} to {}",
            self.source.display(),
            self.dest.display()
        )
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        if tokio::fs::try_exists(&self.dest).await? {
            let backup = ctx.backup_path().await?;
            copy_file(&self.dest, &backup).await?;
            self.backup = Some(backup);
        }

        copy_file(&self.source, &self.dest).await?;
        tokio::fs::remove_file(&self.source).await?;
        self.moved = true;
        Ok(())
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        if !self.moved {
            return Ok(());
        }
        copy_file(&self.dest, &self.source).await?;
        tokio::fs::remove_file(&self.dest).await?;
        if let Some(backup) = &self.backup {
            copy_file(backup, &self.dest).await?;
        }
        Ok(())
    }
}

/// Delete a file, keeping a backup so undo can restore it.
pub struct DeleteInstanceCommand {
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl DeleteInstanceCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup: None,
        }
    }
}

#[async_trait]
impl Command for DeleteInstanceCommand {
    fn describe(&self) -> String {
        format!("Delete {}", self.path.display())
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let backup = ctx.backup_path().await?;
        copy_file(&self.path, &backup).await?;
        tokio::fs::remove_file(&self.path).await?;
        self.backup = Some(backup);
        Ok(())
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        if let Some(backup) = &self.backup {
            copy_file(backup, &self.path).await?;
        }
        Ok(())
    }
}

/// Patch identifying attributes of an instance document in place. Undo
/// rewrites the original document.
pub struct PatchInstanceCommand {
    path: PathBuf,
    edits: Vec<(String, String)>,
    original: Option<InstanceDocument>,
}

impl PatchInstanceCommand {
    pub fn new(path: impl Into<PathBuf>, edits: Vec<(String, String)>) -> Self {
        Self {
            path: path.into(),
            edits,
            original: None,
        }
    }
}

#[async_trait]
impl Command for PatchInstanceCommand {
    fn describe(&self) -> String {
        format!("Patch {} attribute(s) of {}", self.edits.len(), self.path.display())
    }

    async fn execute(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        let mut document = InstanceDocument::load(&self.path).await?;
        self.original = Some(document.clone());

        for (tag, value) in &self.edits {
            let previous = document.set_tag(tag, value);
            debug!(
                file = %self.path.display(),
                tag = %tag,
                from = previous.as_deref().unwrap_or("<unset>"),
                to = %value,
                "Patched attribute"
            );
        }

        document.save(&self.path).await
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        if let Some(original) = &self.original {
            original.save(&self.path).await?;
        }
        Ok(())
    }
}

/// Best-effort removal of a now-empty staging folder (and its group folder
/// when that also empties out). Failures are logged and swallowed; this
/// command is not reversible and must be ordered last.
pub struct CleanupStagingCommand {
    path: PathBuf,
}

impl CleanupStagingCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Command for CleanupStagingCommand {
    fn describe(&self) -> String {
        format!("Cleanup staging folder {}", self.path.display())
    }

    fn requires_rollback(&self) -> bool {
        false
    }

    async fn execute(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        match tokio::fs::remove_dir(&self.path).await {
            Ok(()) => {
                debug!(dir = %self.path.display(), "Removed staging folder");
                // The group folder may now be empty as well.
                if let Some(parent) = self.path.parent() {
                    if tokio::fs::remove_dir(parent).await.is_ok() {
                        debug!(dir = %parent.display(), "Removed group folder");
                    }
                }
            }
            Err(e) => {
                warn!(
                    dir = %self.path.display(),
                    error = %e,
                    "Staging folder not removed"
                );
            }
        }
        Ok(())
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}
