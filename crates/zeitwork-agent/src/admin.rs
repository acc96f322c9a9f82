use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};
use uuid::Uuid;

use zeitwork_core::protocol::ExecRequest;

use crate::exec;
use crate::reconcile::NodeAgent;

/// Maximum admin request frame (64 KiB).
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Request over the agent admin socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminRequest {
    /// Health check.
    Ping,
    /// Summaries of every VM row owned by this server.
    ListVms,
    /// Last `tail` log lines of a VM's ring buffer.
    Logs { vm_id: Uuid, tail: usize },
    /// Open an exec session; on AttachReady the connection upgrades to the
    /// framed exec protocol and stays open until the child exits.
    Attach {
        vm_id: Uuid,
        command: Vec<String>,
        tty: bool,
    },
}

/// Response over the agent admin socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminResponse {
    Pong,
    VmList(Vec<VmSummary>),
    Logs(Vec<String>),
    AttachReady,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub id: Uuid,
    pub status: String,
    pub ip_address: String,
    pub port: i32,
}

/// Read a length-prefixed JSON frame.
async fn read_json<T: serde::de::DeserializeOwned>(stream: &mut UnixStream) -> Result<T> {
    let len = stream
        .read_u32()
        .await
        .with_context(|| "Failed to read admin frame length")? as usize;
    anyhow::ensure!(len <= MAX_REQUEST_SIZE, "Admin frame too large: {}", len);

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .with_context(|| "Failed to read admin frame body")?;
    serde_json::from_slice(&buf).with_context(|| "Failed to parse admin frame")
}

/// Write a length-prefixed JSON frame.
async fn write_json<T: Serialize>(stream: &mut UnixStream, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

/// Serve the admin socket until the task is aborted. One request per
/// connection, except Attach which holds the connection for the session.
pub async fn serve(agent: NodeAgent, socket_path: &Path) -> Result<()> {
    let _ = std::fs::remove_file(socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket dir {}", parent.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind admin socket {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
            .with_context(|| "Failed to set admin socket permissions")?;
    }

    info!(socket = %socket_path.display(), "Admin socket listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let agent = agent.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(agent, stream).await {
                        warn!(error = %e, "Admin connection error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Admin accept failed");
            }
        }
    }
}

async fn handle_connection(agent: NodeAgent, mut stream: UnixStream) -> Result<()> {
    let request: AdminRequest = read_json(&mut stream).await?;

    match request {
        AdminRequest::Ping => write_json(&mut stream, &AdminResponse::Pong).await,

        AdminRequest::ListVms => {
            let response = match agent.local_vms().await {
                Ok(vms) => AdminResponse::VmList(
                    vms.into_iter()
                        .map(|vm| VmSummary {
                            id: vm.id,
                            status: vm.status.to_string(),
                            ip_address: vm.ip_address.to_string(),
                            port: vm.port,
                        })
                        .collect(),
                ),
                Err(e) => AdminResponse::Error {
                    message: e.to_string(),
                },
            };
            write_json(&mut stream, &response).await
        }

        AdminRequest::Logs { vm_id, tail } => {
            let lines = agent.logs().tail(vm_id, tail.min(2048)).await;
            write_json(&mut stream, &AdminResponse::Logs(lines)).await
        }

        AdminRequest::Attach { vm_id, command, tty } => {
            let vm_dir = agent.config().vm_dir(&vm_id);
            if !vm_dir.exists() {
                return write_json(
                    &mut stream,
                    &AdminResponse::Error {
                        message: format!("VM {} is not materialized on this server", vm_id),
                    },
                )
                .await;
            }

            write_json(&mut stream, &AdminResponse::AttachReady).await?;
            exec::relay(
                &vm_dir,
                &ExecRequest {
                    command,
                    tty,
                    env: None,
                },
                stream,
            )
            .await
        }
    }
}
