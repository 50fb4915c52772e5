//! mira-reconcile - Study reconciliation pipeline
//!
//! Resolves conflicts between incoming images and previously archived
//! studies. Conflicting images are staged on disk and queued; a decision
//! descriptor then drives one of four strategies (discard, process as-is,
//! merge, create new study) through a rollback-capable command engine, with
//! every outcome recorded in an append-only history trail.

pub mod command;
pub mod context;
pub mod descriptor;
pub mod history;
pub mod processors;
pub mod reconciler;
pub mod storage;
pub mod uid_mapper;
pub mod worker;

pub use context::ReconcileContext;
pub use descriptor::{ReconcileAction, StudyReconcileDescriptor, StudyReconcileDescriptorParser};
pub use reconciler::{AutoReconcileOutcome, AutoReconciler, ImageReconciler};
pub use uid_mapper::UidMapper;
pub use worker::process_queue_entry;
