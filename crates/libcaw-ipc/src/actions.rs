//! Action names understood by the local service

pub const AUTH_INFO: &str = "auth:info";
pub const AUTH_LOGIN: &str = "auth:login";
pub const AUTH_LOGOUT: &str = "auth:logout";
pub const AUTH_DISCONNECT: &str = "auth:disconnect";
pub const CLIENT_ID: &str = "clientId";
pub const REPO_ACTIVE_PATH: &str = "repo:active-path";
pub const REPO_GET_TMP_DIR: &str = "repo:get-tmp-dir";
pub const REPO_DIFF_BRANCH: &str = "repo:diff-branch";
pub const REPO_DIFF_PEER: &str = "repo:diff-peer";
pub const REPO_CYCLE_BLOCK: &str = "repo:cycle-block";
pub const SYNC_SETUP: &str = "sync:setup";

/// Domain an action is routed to: the auth namespace goes to the wildcard
/// domain, everything else to the code domain
pub fn domain_for(action: &str) -> &'static str {
    if action.starts_with("auth:") {
        crate::WILDCARD_DOMAIN
    } else {
        crate::CODE_DOMAIN
    }
}
