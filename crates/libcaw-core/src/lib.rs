pub mod types;
pub mod shift;
pub mod aggregate;
pub mod tree;
pub mod config;
pub mod error;

pub use error::CawError;
pub use types::{generate_session_id, SessionId};
pub use types::edit::{DiffBlock, EditBlock, LineRange};
pub use types::project::{ChangeSet, PeerReport, Project};
pub use shift::shift_lines;
pub use aggregate::{merge_into, merge_peer_changes, AggregatorConfig};
pub use tree::{Node, PathTree};
pub use config::{load_config, save_config, CawConfig};
