//! Reversible command engine
//!
//! A reconcile run is an ordered list of [`Command`]s executed strictly in
//! sequence by a [`CommandProcessor`]. When any command fails, every
//! previously completed command is undone in reverse order and the shared
//! database transaction is rolled back, restoring the pre-invocation
//! baseline. Commands that report `requires_rollback() == false` are
//! best-effort steps (cleanup); callers must order them last.

pub mod database;
pub mod filesystem;

use async_trait::async_trait;
use mira_common::config::ReconcileConfig;
use mira_common::{Error, Result};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One atomic unit of work within a reconcile run.
#[async_trait]
pub trait Command: Send {
    /// Short description for diagnostics and failure reasons.
    fn describe(&self) -> String;

    /// Whether [`Command::undo`] must be invoked during rollback.
    ///
    /// Returns `false` only for inconsequential best-effort steps; such
    /// commands must be ordered after every reversible command.
    fn requires_rollback(&self) -> bool {
        true
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()>;

    /// Compensate a completed [`Command::execute`]. Only called when
    /// `requires_rollback()` is true.
    async fn undo(&mut self, ctx: &mut ProcessorContext) -> Result<()>;
}

/// Shared state for one processor run: the connection pool, the lazily
/// opened update transaction every database command joins, and the injected
/// configuration.
pub struct ProcessorContext {
    pool: SqlitePool,
    txn: Option<Transaction<'static, Sqlite>>,
    config: ReconcileConfig,
    backup_dir: PathBuf,
    backup_dir_created: bool,
}

impl ProcessorContext {
    pub fn new(pool: SqlitePool, config: ReconcileConfig) -> Self {
        let backup_dir = config
            .filesystem_root
            .join("Temp")
            .join(Uuid::new_v4().to_string());
        Self {
            pool,
            txn: None,
            config,
            backup_dir,
            backup_dir_created: false,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// The shared update transaction, opened on first use. All database
    /// commands of one run commit or roll back together through it.
    pub async fn connection(&mut self) -> Result<&mut SqliteConnection> {
        if self.txn.is_none() {
            self.txn = Some(self.pool.begin().await?);
        }
        match self.txn.as_mut() {
            Some(txn) => Ok(&mut *txn),
            None => Err(Error::Internal("Transaction unavailable".to_string())),
        }
    }

    /// Allocate a backup file path for a filesystem command. The backup
    /// directory lives outside any staging or study folder so restores
    /// never interfere with emptiness checks.
    pub async fn backup_path(&mut self) -> Result<PathBuf> {
        if !self.backup_dir_created {
            tokio::fs::create_dir_all(&self.backup_dir).await?;
            self.backup_dir_created = true;
        }
        Ok(self.backup_dir.join(Uuid::new_v4().to_string()))
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            txn.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            txn.rollback().await?;
        }
        Ok(())
    }

    async fn discard_backups(&mut self) {
        if !self.backup_dir_created {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.backup_dir).await {
            warn!(
                dir = %self.backup_dir.display(),
                error = %e,
                "Failed to remove backup directory"
            );
        }
    }
}

/// Sequencer with rollback.
///
/// Success means every command committed; failure means completed commands
/// were undone in reverse order and the shared transaction was rolled back.
pub struct CommandProcessor {
    description: String,
    ctx: ProcessorContext,
    commands: Vec<Box<dyn Command>>,
    executed: usize,
    failure_reason: Option<String>,
}

impl CommandProcessor {
    pub fn new(description: impl Into<String>, ctx: ProcessorContext) -> Self {
        Self {
            description: description.into(),
            ctx,
            commands: Vec::new(),
            executed: 0,
            failure_reason: None,
        }
    }

    pub fn add_command(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    /// Number of commands that completed during the last run.
    pub fn commands_executed(&self) -> usize {
        self.executed
    }

    /// Human-readable reason of the last failure, if any.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Run every command in order. On the first failure, undo completed
    /// commands in reverse order and return the triggering error.
    pub async fn execute(&mut self) -> Result<()> {
        debug!(processor = %self.description, commands = self.commands.len(), "Executing");

        for index in 0..self.commands.len() {
            let description = self.commands[index].describe();
            debug!(processor = %self.description, command = %description, "Executing command");

            if let Err(e) = self.commands[index].execute(&mut self.ctx).await {
                let reason = format!("{}: {}", description, e);
                warn!(processor = %self.description, reason = %reason, "Command failed, rolling back");
                self.failure_reason = Some(reason);
                self.rollback().await;
                self.ctx.discard_backups().await;
                return Err(e);
            }

            self.executed = index + 1;
        }

        if let Err(e) = self.ctx.commit().await {
            let reason = format!("Commit failed: {}", e);
            warn!(processor = %self.description, reason = %reason, "Rolling back");
            self.failure_reason = Some(reason);
            self.rollback().await;
            self.ctx.discard_backups().await;
            return Err(e);
        }

        self.ctx.discard_backups().await;
        debug!(processor = %self.description, executed = self.executed, "Completed");
        Ok(())
    }

    async fn rollback(&mut self) {
        if let Err(e) = self.ctx.rollback().await {
            warn!(processor = %self.description, error = %e, "Transaction rollback failed");
        }

        for index in (0..self.executed).rev() {
            if !self.commands[index].requires_rollback() {
                continue;
            }
            let description = self.commands[index].describe();
            info!(processor = %self.description, command = %description, "Undoing command");
            if let Err(e) = self.commands[index].undo(&mut self.ctx).await {
                warn!(
                    processor = %self.description,
                    command = %description,
                    error = %e,
                    "Undo failed"
                );
            }
        }
    }
}
