use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use zeitwork_core::protocol::{self, ConfigResponse};

use crate::logs::LogRegistry;

/// Host side of the guest RPC channel for one VM.
///
/// Firecracker delivers guest-initiated vsock connections to port P on the
/// Unix socket `<vm_dir>/v.sock_P`, so the host pre-listens there before
/// the VM boots. The channel speaks HTTP/1.1: `GET /config` returns the
/// VM's runtime config, `POST /logs` is a long-lived stream of stdio
/// lines.
pub struct VmRpc {
    pub vm_id: Uuid,
    pub config: ConfigResponse,
    pub logs: LogRegistry,
    /// Flips once the guest opens its log stream — the boot-complete
    /// signal observed by the reconcile loop.
    pub ready: Arc<AtomicBool>,
}

/// Start serving the RPC listener for a VM. The returned handle is aborted
/// at teardown.
pub async fn serve(rpc: VmRpc, vm_dir: &Path) -> Result<JoinHandle<()>> {
    let listener_path = protocol::vsock_listener_path(
        &vm_dir.display().to_string(),
        protocol::VM_RPC_PORT,
    );
    let _ = tokio::fs::remove_file(&listener_path).await;
    tokio::fs::create_dir_all(vm_dir)
        .await
        .with_context(|| format!("Failed to create VM dir {}", vm_dir.display()))?;

    let listener = UnixListener::bind(&listener_path)
        .with_context(|| format!("Failed to bind vsock listener {}", listener_path))?;

    info!(vm = %rpc.vm_id, listener = %listener_path, "Guest RPC listening");
    let rpc = Arc::new(rpc);

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let rpc = Arc::clone(&rpc);
                    tokio::spawn(async move {
                        let io = hyper_util::rt::TokioIo::new(stream);
                        let service = service_fn(move |req| handle_request(Arc::clone(&rpc), req));
                        if let Err(e) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            debug!(error = %e, "Guest RPC connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Guest RPC accept failed");
                    break;
                }
            }
        }
    });

    Ok(handle)
}

async fn handle_request(
    rpc: Arc<VmRpc>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/config") => {
            let body = serde_json::to_vec(&rpc.config)?;
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body)))?)
        }

        (&Method::POST, "/logs") => {
            // The stream opening is the guest's ready signal: the init
            // agent connects it right before handing off to the customer
            // process.
            rpc.ready.store(true, Ordering::SeqCst);
            info!(vm = %rpc.vm_id, "Guest log stream opened");

            let mut body = req.into_body();
            let mut partial = String::new();
            while let Some(frame) = body.frame().await.transpose()? {
                if let Some(chunk) = frame.data_ref() {
                    partial.push_str(&String::from_utf8_lossy(chunk));
                    while let Some(idx) = partial.find('\n') {
                        let line: String = partial.drain(..=idx).collect();
                        let line = line.trim_end_matches('\n');
                        if !line.is_empty() {
                            rpc.logs.push(rpc.vm_id, line).await;
                        }
                    }
                }
            }
            if !partial.is_empty() {
                rpc.logs.push(rpc.vm_id, &partial).await;
            }

            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::new()))?)
        }

        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))?),
    }
}

/// Dial a guest vsock port through Firecracker's UDS multiplexer.
///
/// Protocol: connect to `<vm_dir>/v.sock`, send `CONNECT <port>\n`, expect
/// `OK <assigned>\n`, then the stream is raw end-to-end.
pub async fn host_connect(vm_dir: &Path, port: u32) -> Result<UnixStream> {
    let uds_path = protocol::vsock_uds_path(&vm_dir.display().to_string());
    let mut stream = UnixStream::connect(&uds_path)
        .await
        .with_context(|| format!("Failed to connect to vsock UDS {}", uds_path))?;

    stream
        .write_all(format!("CONNECT {}\n", port).as_bytes())
        .await
        .with_context(|| "Failed to send CONNECT")?;

    // Byte-wise read so nothing past the handshake line is consumed.
    let mut line = Vec::with_capacity(16);
    loop {
        let b = stream
            .read_u8()
            .await
            .with_context(|| "Failed to read CONNECT response")?;
        if b == b'\n' {
            break;
        }
        line.push(b);
        if line.len() > 64 {
            bail!("Vsock CONNECT response too long");
        }
    }

    let response = String::from_utf8_lossy(&line);
    if !response.starts_with("OK ") {
        bail!("Vsock CONNECT failed: expected 'OK <port>', got '{}'", response);
    }

    Ok(stream)
}
