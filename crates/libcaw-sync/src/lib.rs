//! Sync between an editor and the Code Awareness local service
//!
//! - `SyncScheduler` spaces out refreshes of each file
//! - `Workspace` runs the per-file pipeline: fetch peer data, aggregate it,
//!   keep markers in place across local edits, and hand results to the
//!   editor's collaborators

pub mod error;
pub mod scheduler;
pub mod workspace;

pub use error::SyncError;
pub use scheduler::{SyncScheduler, Trigger};
pub use workspace::{
    Collaborators, Decorator, DiffTarget, FileDecorations, Reaction, RefreshStream, ScmRegistrar,
    SessionStore, Workspace,
};
