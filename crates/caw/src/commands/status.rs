//! Status command - check the connection to the local service

use libcaw_core::CawError;
use libcaw_ipc::actions::AUTH_INFO;
use serde::Serialize;
use serde_json::Value;

use crate::cli::Cli;
use crate::context::{user_id, CawContext};
use crate::output::{output_success, print_human};

#[derive(Serialize)]
struct StatusOutput {
    session: String,
    socket: String,
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

pub async fn run(cli: &Cli) -> Result<(), CawError> {
    let ctx = CawContext::resolve(cli)?;
    let socket = ctx.client_config().session_path();
    let client = ctx.connect().await?;

    let auth = client.transmit(AUTH_INFO, Value::Null).await?;
    let user = auth.get("user").and_then(user_id);
    client.shutdown().await;

    let out = StatusOutput {
        session: ctx.session.to_string(),
        socket: socket.display().to_string(),
        connected: true,
        user,
    };

    print_human(cli, &format!("Connected to {}", out.socket));
    print_human(cli, &format!("Session: {}", out.session));
    match &out.user {
        Some(user) => print_human(cli, &format!("Signed in as {}", user)),
        None => print_human(cli, "Not signed in"),
    }
    output_success(cli, out);
    Ok(())
}
