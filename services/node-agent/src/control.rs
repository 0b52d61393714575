//! Monitor and guest-agent control over per-VM unix sockets.
//!
//! Both channels speak newline-delimited JSON. The monitor follows the QMP
//! handshake: a greeting from the hypervisor, `qmp_capabilities`, then
//! commands each answered by `return` or `error` (asynchronous `event`
//! messages may be interleaved and are skipped).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use meshvisor_id::VmId;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::paths::NodePaths;
use crate::runtime::{ControlChannel, ControlClient};

/// Default bound for one control exchange.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Monitor reply.
#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(rename = "return")]
    ret: Option<Value>,
    error: Option<ReplyError>,
    event: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    class: String,
    desc: String,
}

/// Control client over the sockets laid out by [`NodePaths`].
#[derive(Debug, Clone)]
pub struct SocketControl {
    paths: NodePaths,
    timeout: Duration,
}

impl SocketControl {
    pub fn new(paths: NodePaths) -> Self {
        Self {
            paths,
            timeout: DEFAULT_CONTROL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn monitor_execute(&self, vm: &VmId, command: Value) -> Result<()> {
        let path = self.paths.monitor_path(vm);
        let exchange = async {
            let stream = connect(&path).await?;
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);

            // greeting
            read_line(&mut reader, &path).await?;
            send_message(&mut write, &json!({ "execute": "qmp_capabilities" }), &path).await?;
            read_reply(&mut reader, &path).await?;

            send_message(&mut write, &command, &path).await?;
            read_reply(&mut reader, &path).await
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| AgentError::Unreachable(format!("monitor timed out: {}", path.display())))?
    }

    async fn guest_execute(&self, vm: &VmId, command: Value) -> Result<()> {
        let path = self.paths.guest_path(vm);
        let exchange = async {
            let mut stream = connect(&path).await?;
            send_message(&mut stream, &command, &path).await
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                AgentError::Unreachable(format!("guest agent timed out: {}", path.display()))
            })?
    }
}

async fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path)
        .await
        .map_err(|e| AgentError::Unreachable(format!("{}: {e}", path.display())))
}

async fn send_message<W>(stream: &mut W, msg: &Value, path: &Path) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = msg.to_string();
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|e| AgentError::Unreachable(format!("{}: {e}", path.display())))?;
    stream
        .flush()
        .await
        .map_err(|e| AgentError::Unreachable(format!("{}: {e}", path.display())))
}

async fn read_line<R>(reader: &mut R, path: &Path) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| AgentError::Unreachable(format!("{}: {e}", path.display())))?;
    if n == 0 {
        return Err(AgentError::Unreachable(format!(
            "{}: connection closed",
            path.display()
        )));
    }
    Ok(line)
}

async fn read_reply<R>(reader: &mut R, path: &Path) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = read_line(reader, path).await?;
        let reply: Reply = serde_json::from_str(&line)
            .map_err(|e| AgentError::Parse(format!("monitor reply: {e}")))?;

        if let Some(event) = reply.event {
            debug!(event, "Skipping monitor event");
            continue;
        }
        if let Some(err) = reply.error {
            return Err(AgentError::Unreachable(format!(
                "monitor error {}: {}",
                err.class, err.desc
            )));
        }
        if reply.ret.is_some() {
            return Ok(());
        }
        return Err(AgentError::Parse(format!("unexpected monitor reply: {}", line.trim())));
    }
}

#[async_trait]
impl ControlClient for SocketControl {
    async fn shutdown(&self, vm: &VmId, channel: ControlChannel) -> Result<()> {
        debug!(vm_id = %vm, %channel, "Sending shutdown request");
        match channel {
            ControlChannel::Monitor => {
                self.monitor_execute(vm, json!({ "execute": "system_powerdown" }))
                    .await
            }
            ControlChannel::Guest => {
                self.guest_execute(vm, json!({ "execute": "guest-shutdown" }))
                    .await
            }
        }
    }

    async fn set_console_password(&self, vm: &VmId, password: &str) -> Result<()> {
        self.monitor_execute(
            vm,
            json!({
                "execute": "change-vnc-password",
                "arguments": { "password": password },
            }),
        )
        .await
    }
}
