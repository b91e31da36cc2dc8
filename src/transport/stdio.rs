//! Stdio child-process transport, adapted from
//! `connection.rs::connect_stdio`.

use crate::config::BackendConfig;
use anyhow::{anyhow, Context, Result};
use rmcp::transport::TokioChildProcess;
use rmcp::ServiceExt;
use std::process::Stdio;
use tokio::process::Command;

/// Environment marker set on every spawned child, so well-behaved servers
/// can recognise they're running under the gateway and mute shutdown
/// tracebacks. Ported from the original's `server_env["MCP_BRIDGE_CHILD"]`.
const MANAGED_MARKER_KEY: &str = "MCP_BRIDGE_MANAGED";

pub async fn connect(config: &BackendConfig) -> Result<super::Session> {
    let command_str = config
        .command
        .as_ref()
        .ok_or_else(|| anyhow!("no command specified for stdio transport"))?
        .trim();

    if command_str.is_empty() {
        return Err(anyhow!("no command specified for stdio transport"));
    }

    let (executable, extra_args) = if let Some(space) = command_str.find(' ') {
        let (exe, rest) = command_str.split_at(space);
        let rest_args: Vec<String> = rest.trim().split_whitespace().map(String::from).collect();
        (exe.to_string(), rest_args)
    } else {
        (command_str.to_string(), Vec::new())
    };

    let mut args = config.args.clone();
    args.splice(0..0, extra_args);

    let mut cmd = Command::new(&executable);
    cmd.args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env(MANAGED_MARKER_KEY, "1");

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    let full_cmd = format!("{executable} {}", args.join(" "))
        .trim_end()
        .to_string();
    let transport = TokioChildProcess::new(cmd)
        .map_err(|e| anyhow!("failed to spawn MCP server process (command: {full_cmd}): {e}"))?;

    let service = ()
        .serve(transport)
        .await
        .context("failed to initialize MCP client service")?;

    Ok(service)
}
