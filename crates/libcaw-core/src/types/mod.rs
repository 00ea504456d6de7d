pub mod ids;
pub mod edit;
pub mod project;

pub use ids::{generate_session_id, SessionId};
pub use edit::{DiffBlock, EditBlock, LineRange};
pub use project::{ChangeSet, PeerReport, Project};
