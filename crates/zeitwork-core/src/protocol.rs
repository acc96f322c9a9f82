use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Well-known vsock context id of the host.
pub const HOST_CID: u32 = 2;

/// Guest→host port: HTTP/1.1 over the stream socket (`GET /config`,
/// `POST /logs`).
pub const VM_RPC_PORT: u32 = 1024;

/// Host→guest port: framed bidirectional channel (`/exec`).
pub const VM_EXEC_PORT: u32 = 1025;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Path of the OCI-style process descriptor inside the root image.
pub const PROCESS_SPEC_PATH: &str = "/zeitwork/process.json";

// ============================================================================
// Control message types
// ============================================================================

/// Runtime config the guest fetches from the host after boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    /// Environment as KEY=VALUE strings.
    pub env: Vec<String>,
    /// Guest address in /31 CIDR form, e.g. "10.1.0.3/31".
    pub ip_addr: String,
    /// Host-side peer address, used as the default gateway.
    pub ip_gw: String,
    pub hostname: String,
}

/// Process descriptor baked into the root image by the builder.
///
/// The init agent reads this from [`PROCESS_SPEC_PATH`] and launches the
/// customer process accordingly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
}

fn default_cwd() -> String {
    "/".to_string()
}

/// Opening control frame of an exec session (host → guest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub tty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
}

/// Terminal dimensions for TTY-mode exec sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

/// In-band control frames exchanged during an exec session.
///
/// Wire shape is `{"resize": {"rows": r, "cols": c}}` or `{"exit": code}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecControl {
    Resize { resize: WindowSize },
    Exit { exit: i32 },
}

// ============================================================================
// Frame codec (type byte + length-prefixed payload)
// ============================================================================

/// Frame discriminator: text frames carry JSON control messages, binary
/// frames carry raw bytes (stdin/stdout/pty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Text => 0x01,
            FrameKind::Binary => 0x02,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(FrameKind::Text),
            0x02 => Ok(FrameKind::Binary),
            other => anyhow::bail!("Unknown frame kind byte: {:#x}", other),
        }
    }
}

/// A single frame on the exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Text,
            payload,
        }
    }

    pub fn binary(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Binary,
            payload,
        }
    }

    /// Build a text frame from a serializable control message.
    pub fn control<T: Serialize>(msg: &T) -> Result<Self> {
        let payload = serde_json::to_vec(msg).with_context(|| "Failed to serialize control")?;
        Ok(Self::text(payload))
    }

    /// Parse a text frame's payload as a control message.
    pub fn parse_control<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        anyhow::ensure!(self.kind == FrameKind::Text, "Not a text frame");
        serde_json::from_slice(&self.payload).with_context(|| "Failed to parse control frame")
    }
}

/// Read one frame: 1-byte kind, 4-byte big-endian length, payload.
pub async fn read_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut kind_buf = [0u8; 1];
    reader
        .read_exact(&mut kind_buf)
        .await
        .with_context(|| "Failed to read frame kind")?;
    let kind = FrameKind::from_byte(kind_buf[0])?;

    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .with_context(|| "Failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("Frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .with_context(|| "Failed to read frame payload")?;

    Ok(Frame { kind, payload })
}

/// Write one frame.
pub async fn write_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<()> {
    anyhow::ensure!(
        frame.payload.len() <= MAX_FRAME_SIZE,
        "Frame too large: {} bytes",
        frame.payload.len()
    );
    writer
        .write_all(&[frame.kind.to_byte()])
        .await
        .with_context(|| "Failed to write frame kind")?;
    writer
        .write_all(&(frame.payload.len() as u32).to_be_bytes())
        .await
        .with_context(|| "Failed to write frame length")?;
    writer
        .write_all(&frame.payload)
        .await
        .with_context(|| "Failed to write frame payload")?;
    writer.flush().await.with_context(|| "Failed to flush frame")?;
    Ok(())
}

/// Blocking variant of [`read_frame`] for the guest side, which runs
/// plain threads instead of an async runtime.
pub fn read_frame_blocking<R: std::io::Read>(reader: &mut R) -> Result<Frame> {
    let mut kind_buf = [0u8; 1];
    reader
        .read_exact(&mut kind_buf)
        .with_context(|| "Failed to read frame kind")?;
    let kind = FrameKind::from_byte(kind_buf[0])?;

    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .with_context(|| "Failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("Frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .with_context(|| "Failed to read frame payload")?;

    Ok(Frame { kind, payload })
}

/// Blocking variant of [`write_frame`].
pub fn write_frame_blocking<W: std::io::Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    anyhow::ensure!(
        frame.payload.len() <= MAX_FRAME_SIZE,
        "Frame too large: {} bytes",
        frame.payload.len()
    );
    writer
        .write_all(&[frame.kind.to_byte()])
        .with_context(|| "Failed to write frame kind")?;
    writer
        .write_all(&(frame.payload.len() as u32).to_be_bytes())
        .with_context(|| "Failed to write frame length")?;
    writer
        .write_all(&frame.payload)
        .with_context(|| "Failed to write frame payload")?;
    writer.flush().with_context(|| "Failed to flush frame")?;
    Ok(())
}

// ============================================================================
// Firecracker vsock UDS layout (host side)
// ============================================================================

/// Path of the Firecracker vsock multiplexer socket for a VM workdir.
pub fn vsock_uds_path(vm_dir: &str) -> String {
    format!("{}/v.sock", vm_dir)
}

/// Path the host must pre-listen on to receive guest-initiated
/// connections to `port` (Firecracker appends `_<port>` to the UDS path).
pub fn vsock_listener_path(vm_dir: &str, port: u32) -> String {
    format!("{}/v.sock_{}", vm_dir, port)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_response_roundtrip() {
        let config = ConfigResponse {
            env: vec!["PORT=8080".to_string(), "NODE_ENV=production".to_string()],
            ip_addr: "10.1.0.3/31".to_string(),
            ip_gw: "10.1.0.2".to_string(),
            hostname: "d-4f2a".to_string(),
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ConfigResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.env.len(), 2);
        assert_eq!(parsed.ip_addr, "10.1.0.3/31");
        assert_eq!(parsed.ip_gw, "10.1.0.2");
    }

    #[test]
    fn test_process_spec_defaults() {
        let spec: ProcessSpec =
            serde_json::from_str(r#"{"args": ["/app/server"], "uid": 1000, "gid": 1000}"#).unwrap();
        assert_eq!(spec.cwd, "/");
        assert!(spec.env.is_empty());
        assert_eq!(spec.args, vec!["/app/server"]);
    }

    #[test]
    fn test_exec_request_omits_empty_env() {
        let req = ExecRequest {
            command: vec!["sh".to_string()],
            tty: true,
            env: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("env"));
    }

    #[test]
    fn test_exec_control_resize_wire_shape() {
        let control = ExecControl::Resize {
            resize: WindowSize { rows: 40, cols: 120 },
        };
        let json = serde_json::to_string(&control).unwrap();
        assert_eq!(json, r#"{"resize":{"rows":40,"cols":120}}"#);
        let parsed: ExecControl = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, control);
    }

    #[test]
    fn test_exec_control_exit_wire_shape() {
        let control = ExecControl::Exit { exit: 137 };
        let json = serde_json::to_string(&control).unwrap();
        assert_eq!(json, r#"{"exit":137}"#);
        let parsed: ExecControl = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, control);
    }

    #[test]
    fn test_blocking_frame_roundtrip() {
        let frame = Frame::control(&ExecControl::Exit { exit: 7 }).unwrap();
        let mut buf = Vec::new();
        write_frame_blocking(&mut buf, &frame).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame_blocking(&mut cursor).unwrap();
        assert_eq!(read_back, frame);
    }

    #[tokio::test]
    async fn test_async_and_blocking_codecs_agree() {
        let frame = Frame::binary(b"same bytes".to_vec());
        let mut async_buf = Vec::new();
        write_frame(&mut async_buf, &frame).await.unwrap();
        let mut blocking_buf = Vec::new();
        write_frame_blocking(&mut blocking_buf, &frame).unwrap();
        assert_eq!(async_buf, blocking_buf);
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frame = Frame::binary(b"raw bytes".to_vec());
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back, frame);
    }

    #[tokio::test]
    async fn test_control_frame_roundtrip() {
        let frame = Frame::control(&ExecControl::Exit { exit: 0 }).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        let control: ExecControl = read_back.parse_control().unwrap();
        assert_eq!(control, ExecControl::Exit { exit: 0 });
    }

    #[tokio::test]
    async fn test_read_frame_rejects_unknown_kind() {
        let mut cursor = std::io::Cursor::new(vec![0x7fu8, 0, 0, 0, 0]);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let mut buf = vec![0x01u8];
        buf.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
        let err = format!("{}", result.unwrap_err());
        assert!(err.contains("too large"));
    }

    #[test]
    fn test_parse_control_rejects_binary_frame() {
        let frame = Frame::binary(b"{}".to_vec());
        let result: Result<ExecControl> = frame.parse_control();
        assert!(result.is_err());
    }

    #[test]
    fn test_vsock_paths() {
        assert_eq!(
            vsock_uds_path("/var/lib/zeitwork/vms/abc"),
            "/var/lib/zeitwork/vms/abc/v.sock"
        );
        assert_eq!(
            vsock_listener_path("/var/lib/zeitwork/vms/abc", VM_RPC_PORT),
            "/var/lib/zeitwork/vms/abc/v.sock_1024"
        );
    }

    #[test]
    fn test_port_constants() {
        assert_eq!(HOST_CID, 2);
        assert_eq!(VM_RPC_PORT, 1024);
        assert_eq!(VM_EXEC_PORT, 1025);
    }
}
