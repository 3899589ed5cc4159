use {
    anyhow::{Context, bail},
    clap::Subcommand,
    pollcast_config::PollcastConfig,
    serde_json::{Value, json},
};

#[derive(Subcommand)]
pub enum PollAction {
    /// Launch a pending poll on every authorized channel.
    Launch { id: String },
    /// Cancel a running poll.
    Cancel {
        id: String,
        /// Who cancelled, recorded in the poll result.
        #[arg(long)]
        actor: Option<String>,
    },
}

/// Base URL of the local server described by `config`. A wildcard bind
/// address is reached over loopback.
pub fn server_url(config: &PollcastConfig) -> String {
    let host = match config.server.bind.as_str() {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    };
    format!("http://{host}:{}", config.server.port)
}

pub async fn handle_polls(action: PollAction, server: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let server = server.trim_end_matches('/');
    let (path, body) = match &action {
        PollAction::Launch { id } => (format!("/api/polls/{id}/launch"), None),
        PollAction::Cancel { id, actor } => {
            (format!("/api/polls/{id}/cancel"), Some(json!({ "actor": actor })))
        },
    };
    let response = send(&client, &format!("{server}{path}"), body).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn send(client: &reqwest::Client, url: &str, body: Option<Value>) -> anyhow::Result<Value> {
    let mut request = client.post(url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("cannot reach pollcast server at {url}"))?;
    let status = response.status();
    let payload: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = payload["error"].as_str().unwrap_or("no error message");
        bail!("server answered {status}: {message}");
    }
    Ok(payload)
}
