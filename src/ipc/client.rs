//! Control client used by the CLI subcommands

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::ipc::protocol::{parse_response, serialize_command, Command, Response};

/// Send one command to a running daemon and wait for its response
pub async fn send_command(socket_path: &Path, command: &Command) -> Result<Response> {
    let stream = UnixStream::connect(socket_path).await.with_context(|| {
        format!(
            "Failed to connect to daemon at {} (is it running?)",
            socket_path.display()
        )
    })?;
    let (reader, mut writer) = stream.into_split();

    let json = serialize_command(command).context("Failed to serialize command")?;
    writer
        .write_all(&json)
        .await
        .context("Failed to send command")?;

    let mut line = String::new();
    let read = BufReader::new(reader)
        .read_line(&mut line)
        .await
        .context("Failed to read response")?;
    if read == 0 {
        return Err(anyhow!("Daemon closed the connection without responding"));
    }

    parse_response(line.trim().as_bytes()).context("Failed to parse response")
}
