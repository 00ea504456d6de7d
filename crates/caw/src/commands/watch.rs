//! Watch command - stream pushed events, optionally tracking one file

use std::path::Path;
use std::sync::Arc;

use libcaw_core::CawError;
use libcaw_ipc::Event;
use libcaw_sync::{FileDecorations, Reaction, Workspace};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::cli::Cli;
use crate::context::{user_id, CawContext, CliCollaborators};
use crate::output::{output_line, print_human};

pub async fn run(cli: &Cli, file: Option<&Path>) -> Result<(), CawError> {
    let ctx = CawContext::resolve(cli)?;
    let client = ctx.connect().await?;
    let collab = CliCollaborators::new(ctx.session.clone());
    let mut events = client.subscribe();

    let (workspace, fired) = Workspace::new(client.clone(), collab.collaborators(), &ctx.config);
    let workspace = Arc::new(workspace);
    if let Some(user) = collab.load_user(&client).await? {
        print_human(cli, &format!("Signed in as {}", user));
    }
    workspace.init().await?;

    let (marker_tx, mut markers) = mpsc::unbounded_channel::<FileDecorations>();
    collab.decorations.on_update(move |d| {
        let _ = marker_tx.send(d.clone());
    });

    let driver = {
        let workspace = workspace.clone();
        tokio::spawn(async move { workspace.drive_refreshes(fired).await })
    };

    if let Some(file) = file {
        let path = std::fs::canonicalize(file)?;
        let doc = std::fs::read_to_string(&path)?;
        let path = path.to_string_lossy().into_owned();
        if !workspace.set_active_file(&path, &doc) {
            warn!(path = %path, "File is a peer copy, not tracking it");
        }
    }

    print_human(cli, "Watching, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(d) = markers.recv() => {
                let data = json!({ "kind": "markers", "path": d.path, "lines": d.lines });
                output_line(cli, &data, || format!("markers {}: {:?}", d.path, d.lines));
            }
            received = events.recv() => {
                let event = match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                output_line(cli, &event, || describe(&event));

                match &event {
                    Event::AuthLogin { user, .. } => collab.session.set_user(user_id(user)),
                    Event::AuthLogout => collab.session.set_user(None),
                    _ => {}
                }
                match workspace.handle_event(&event).await {
                    Ok(Reaction::OpenDiff(target)) => {
                        let data = json!({
                            "kind": "open_diff",
                            "peer_file": target.peer_file,
                            "user_file": target.user_file,
                            "title": target.title,
                        });
                        output_line(cli, &data, || {
                            format!("diff {} <-> {}", target.user_file, target.peer_file)
                        });
                    }
                    Ok(Reaction::CloseDiff) => {
                        output_line(cli, &json!({ "kind": "close_diff" }), || "close diff".to_string());
                    }
                    Ok(Reaction::Nothing) => {}
                    Err(e) => warn!(error = %e, "Event handling failed"),
                }
            }
        }
    }

    driver.abort();
    client.shutdown().await;
    Ok(())
}

fn describe(event: &Event) -> String {
    match event {
        Event::AuthLogin { user, .. } => {
            format!("login {}", user_id(user).unwrap_or_else(|| "?".to_string()))
        }
        Event::AuthLogout => "logout".to_string(),
        Event::BranchSelect { branch } => format!("branch selected: {}", branch),
        Event::BranchUnselect => "branch unselected".to_string(),
        Event::BranchRefresh { .. } => "branches changed".to_string(),
        Event::ContribSelect { contrib } => format!("peer selected: {}", contrib),
        Event::ContribUnselect => "peer unselected".to_string(),
        Event::Refresh { .. } => "refresh".to_string(),
        Event::Reset => "local service reset".to_string(),
        Event::Unknown { domain, action, .. } => format!("{}:{} (unhandled)", domain, action),
    }
}
