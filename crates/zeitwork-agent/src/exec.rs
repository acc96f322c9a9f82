use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use zeitwork_core::protocol::{
    self, ExecControl, ExecRequest, Frame, FrameKind, VM_EXEC_PORT, WindowSize,
};

use crate::vsock_host;

/// Events surfaced by an exec session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    /// Raw output (merged stdout/stderr, or PTY bytes in TTY mode).
    Output(Vec<u8>),
    /// Child exited with this code; the session is over.
    Exited(i32),
}

/// A live exec session against a guest.
///
/// Binary frames carry bytes in both directions; JSON text frames carry
/// resize requests (host → guest) and the final exit code (guest → host).
pub struct ExecSession<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ExecSession<S> {
    /// Open a session on an already-connected exec channel by sending the
    /// initial control frame.
    pub async fn open(mut stream: S, request: &ExecRequest) -> Result<Self> {
        let frame = Frame::control(request)?;
        protocol::write_frame(&mut stream, &frame)
            .await
            .with_context(|| "Failed to send exec request")?;
        Ok(Self { stream })
    }

    /// Write stdin bytes to the child.
    pub async fn send_stdin(&mut self, data: &[u8]) -> Result<()> {
        protocol::write_frame(&mut self.stream, &Frame::binary(data.to_vec())).await
    }

    /// Resize the child's PTY (TTY mode only; the guest ignores it
    /// otherwise).
    pub async fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        let control = ExecControl::Resize {
            resize: WindowSize { rows, cols },
        };
        protocol::write_frame(&mut self.stream, &Frame::control(&control)?).await
    }

    /// Next event from the guest. Returns Exited exactly once, after which
    /// the channel is done.
    pub async fn next_event(&mut self) -> Result<ExecEvent> {
        loop {
            let frame = protocol::read_frame(&mut self.stream).await?;
            match frame.kind {
                FrameKind::Binary => return Ok(ExecEvent::Output(frame.payload)),
                FrameKind::Text => {
                    let control: ExecControl = frame.parse_control()?;
                    match control {
                        ExecControl::Exit { exit } => return Ok(ExecEvent::Exited(exit)),
                        // Resize frames only flow host → guest; skip
                        // anything unexpected rather than killing the
                        // session.
                        ExecControl::Resize { .. } => {
                            debug!("Ignoring resize frame from guest");
                        }
                    }
                }
            }
        }
    }
}

/// Open an exec session against a VM's guest endpoint.
pub async fn attach(
    vm_dir: &Path,
    request: &ExecRequest,
) -> Result<ExecSession<tokio::net::UnixStream>> {
    let stream = vsock_host::host_connect(vm_dir, VM_EXEC_PORT)
        .await
        .with_context(|| "Failed to dial guest exec endpoint")?;
    info!(command = ?request.command, tty = request.tty, "Exec session opened");
    ExecSession::open(stream, request).await
}

/// Relay an already-framed client connection into a VM's exec endpoint.
///
/// The client speaks the same frame protocol as the guest, so after the
/// initial request frame the relay is a verbatim bidirectional copy.
/// Either side closing tears the whole session down, which terminates the
/// child group in the guest.
pub async fn relay<C>(vm_dir: &Path, request: &ExecRequest, mut client: C) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut guest = vsock_host::host_connect(vm_dir, VM_EXEC_PORT)
        .await
        .with_context(|| "Failed to dial guest exec endpoint")?;

    protocol::write_frame(&mut guest, &Frame::control(request)?)
        .await
        .with_context(|| "Failed to send exec request")?;

    // Peer-close degrades to a clean shutdown, never an error surfaced to
    // the admin client.
    match tokio::io::copy_bidirectional(&mut client, &mut guest).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(()),
        Err(e) => Err(e).with_context(|| "Exec relay failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_session_sends_request_then_streams() {
        let (host_side, mut guest_side) = duplex(4096);

        let guest = tokio::spawn(async move {
            // Guest reads the opening request frame.
            let frame = protocol::read_frame(&mut guest_side).await.unwrap();
            let request: ExecRequest = frame.parse_control().unwrap();
            assert_eq!(request.command, vec!["echo", "hi"]);
            assert!(!request.tty);

            // Guest emits output then the exit control frame.
            protocol::write_frame(&mut guest_side, &Frame::binary(b"hi\n".to_vec()))
                .await
                .unwrap();
            protocol::write_frame(
                &mut guest_side,
                &Frame::control(&ExecControl::Exit { exit: 0 }).unwrap(),
            )
            .await
            .unwrap();
        });

        let request = ExecRequest {
            command: vec!["echo".to_string(), "hi".to_string()],
            tty: false,
            env: None,
        };
        let mut session = ExecSession::open(host_side, &request).await.unwrap();

        assert_eq!(
            session.next_event().await.unwrap(),
            ExecEvent::Output(b"hi\n".to_vec())
        );
        assert_eq!(session.next_event().await.unwrap(), ExecEvent::Exited(0));
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_stdin_and_resize_frames() {
        let (host_side, mut guest_side) = duplex(4096);

        let guest = tokio::spawn(async move {
            let _request = protocol::read_frame(&mut guest_side).await.unwrap();

            let stdin = protocol::read_frame(&mut guest_side).await.unwrap();
            assert_eq!(stdin.kind, FrameKind::Binary);
            assert_eq!(stdin.payload, b"input\n");

            let resize = protocol::read_frame(&mut guest_side).await.unwrap();
            let control: ExecControl = resize.parse_control().unwrap();
            assert_eq!(
                control,
                ExecControl::Resize {
                    resize: WindowSize { rows: 50, cols: 132 }
                }
            );
        });

        let request = ExecRequest {
            command: vec!["sh".to_string()],
            tty: true,
            env: None,
        };
        let mut session = ExecSession::open(host_side, &request).await.unwrap();
        session.send_stdin(b"input\n").await.unwrap();
        session.resize(50, 132).await.unwrap();
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_code_is_preserved() {
        let (host_side, mut guest_side) = duplex(1024);
        tokio::spawn(async move {
            let _request = protocol::read_frame(&mut guest_side).await.unwrap();
            protocol::write_frame(
                &mut guest_side,
                &Frame::control(&ExecControl::Exit { exit: 137 }).unwrap(),
            )
            .await
            .unwrap();
        });

        let mut session = ExecSession::open(
            host_side,
            &ExecRequest {
                command: vec!["false".to_string()],
                tty: false,
                env: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(session.next_event().await.unwrap(), ExecEvent::Exited(137));
    }
}
