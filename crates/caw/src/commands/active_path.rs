//! Active-path command - show lines changed by peers in one file

use std::collections::BTreeMap;
use std::path::Path;

use libcaw_core::CawError;
use libcaw_sync::Workspace;
use serde::Serialize;

use crate::cli::Cli;
use crate::context::{CawContext, CliCollaborators};
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct ActivePathOutput {
    path: String,
    root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    lines: Vec<u32>,
    by_commit: BTreeMap<String, Vec<u32>>,
    peer_files: Vec<String>,
}

pub async fn run(cli: &Cli, file: &Path) -> Result<(), CawError> {
    let ctx = CawContext::resolve(cli)?;
    let path = canonical(file)?;
    let doc = std::fs::read_to_string(&path)?;

    let client = ctx.connect().await?;
    let collab = CliCollaborators::new(ctx.session.clone());
    collab.load_user(&client).await?;

    let (workspace, _fired) = Workspace::new(client.clone(), collab.collaborators(), &ctx.config);
    let project = workspace.refresh_active_file(&path, &doc).await?;
    client.shutdown().await;

    let (lines, by_commit) = collab
        .decorations
        .latest()
        .map(|d| (d.lines, d.by_commit))
        .unwrap_or_default();
    let out = ActivePathOutput {
        peer_files: workspace.peer_files(&project.root),
        path,
        root: project.root,
        branch: project.branch,
        lines,
        by_commit,
    };

    if out.lines.is_empty() {
        print_human(cli, "No peer changes");
    } else {
        for (commit, lines) in &out.by_commit {
            print_human(cli, &format!("{}  {}", commit, join(lines)));
        }
        print_human(cli, &format!("lines: {}", join(&out.lines)));
    }
    output_success(cli, out);
    Ok(())
}

fn canonical(file: &Path) -> Result<String, CawError> {
    if !file.exists() {
        return Err(CawError::NotFound(format!("file {}", file.display())));
    }
    let path = std::fs::canonicalize(file)?;
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| CawError::InvalidArgs(format!("path {} is not UTF-8", path.display())))
}

fn join(lines: &[u32]) -> String {
    lines
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
