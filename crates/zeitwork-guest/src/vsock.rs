use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result, bail};

use zeitwork_core::protocol::{ConfigResponse, HOST_CID, VM_RPC_PORT};

/// A connected AF_VSOCK stream.
pub struct VsockStream {
    fd: OwnedFd,
}

impl VsockStream {
    /// Connect to the host on a well-known port.
    #[cfg(target_os = "linux")]
    pub fn connect_host(port: u32) -> Result<Self> {
        // SAFETY: plain socket syscalls with a stack-local sockaddr.
        unsafe {
            let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return Err(std::io::Error::last_os_error()).with_context(|| "vsock socket failed");
            }
            let fd = OwnedFd::from_raw_fd(fd);

            let mut addr: libc::sockaddr_vm = std::mem::zeroed();
            addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
            addr.svm_cid = HOST_CID;
            addr.svm_port = port;

            let rc = libc::connect(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
            );
            if rc < 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("vsock connect to host:{} failed", port));
            }
            Ok(Self { fd })
        }
    }

    /// Wrap an already-connected fd (accepted connections, tests over
    /// socketpairs).
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone().with_context(|| "vsock fd clone failed")?,
        })
    }
}

impl Read for VsockStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for VsockStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A listening AF_VSOCK socket (the guest exec endpoint).
#[cfg(target_os = "linux")]
pub struct VsockListener {
    fd: OwnedFd,
}

#[cfg(target_os = "linux")]
impl VsockListener {
    pub fn bind(port: u32) -> Result<Self> {
        // SAFETY: socket/bind/listen with a stack-local sockaddr.
        unsafe {
            let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return Err(std::io::Error::last_os_error()).with_context(|| "vsock socket failed");
            }
            let fd = OwnedFd::from_raw_fd(fd);

            let mut addr: libc::sockaddr_vm = std::mem::zeroed();
            addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
            addr.svm_cid = libc::VMADDR_CID_ANY;
            addr.svm_port = port;

            if libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
            ) < 0
            {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("vsock bind on port {} failed", port));
            }
            if libc::listen(fd.as_raw_fd(), 8) < 0 {
                return Err(std::io::Error::last_os_error()).with_context(|| "vsock listen failed");
            }
            Ok(Self { fd })
        }
    }

    pub fn accept(&self) -> Result<VsockStream> {
        let fd = unsafe { libc::accept(self.fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| "vsock accept failed");
        }
        Ok(VsockStream::from_owned_fd(unsafe { OwnedFd::from_raw_fd(fd) }))
    }
}

// ============================================================================
// Minimal HTTP/1.1 over vsock (an init binary carries no HTTP stack)
// ============================================================================

/// Fetch the VM's runtime config from the host.
#[cfg(target_os = "linux")]
pub fn fetch_config() -> Result<ConfigResponse> {
    let mut stream = VsockStream::connect_host(VM_RPC_PORT)?;
    stream
        .write_all(b"GET /config HTTP/1.1\r\nHost: host\r\nConnection: close\r\n\r\n")
        .with_context(|| "Failed to send config request")?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .with_context(|| "Failed to read config response")?;

    parse_http_json(&response)
}

/// Parse a complete HTTP/1.1 response, expecting a 200 with a JSON body.
pub fn parse_http_json<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T> {
    let text = String::from_utf8_lossy(raw);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        bail!("Malformed HTTP response: no header terminator");
    };

    let status_line = head.lines().next().unwrap_or("");
    let mut parts = status_line.split_whitespace();
    let _version = parts.next();
    let code = parts.next().unwrap_or("");
    if code != "200" {
        bail!("Config request failed: {}", status_line);
    }

    serde_json::from_str(body.trim_start_matches(|c: char| c.is_ascii_whitespace()))
        .with_context(|| "Failed to parse config JSON")
}

/// Long-lived `POST /logs` stream. Each line is sent as one HTTP chunk so
/// the host sees output as it happens.
pub struct LogStream<W: Write> {
    stream: W,
}

impl<W: Write> LogStream<W> {
    /// Send the request head and return the ready stream.
    pub fn open(mut stream: W) -> Result<Self> {
        stream
            .write_all(
                b"POST /logs HTTP/1.1\r\nHost: host\r\nTransfer-Encoding: chunked\r\n\r\n",
            )
            .with_context(|| "Failed to open log stream")?;
        stream.flush()?;
        Ok(Self { stream })
    }

    /// Ship one chunk of output (any bytes; the host splits on newlines).
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        write!(self.stream, "{:x}\r\n", data.len())?;
        self.stream.write_all(data)?;
        self.stream.write_all(b"\r\n")?;
        self.stream.flush()?;
        Ok(())
    }

    /// Terminate the chunked stream cleanly.
    pub fn close(mut self) -> Result<()> {
        self.stream.write_all(b"0\r\n\r\n")?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Open the log stream to the host.
#[cfg(target_os = "linux")]
pub fn open_log_stream() -> Result<LogStream<VsockStream>> {
    let stream = VsockStream::connect_host(VM_RPC_PORT)?;
    LogStream::open(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_json_ok() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"env\":[\"A=1\"],\"ip_addr\":\"10.1.0.3/31\",\"ip_gw\":\"10.1.0.2\",\"hostname\":\"vm-1\"}";
        let config: ConfigResponse = parse_http_json(raw).unwrap();
        assert_eq!(config.env, vec!["A=1"]);
        assert_eq!(config.hostname, "vm-1");
    }

    #[test]
    fn test_parse_http_json_rejects_error_status() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\n\r\noops";
        let result: Result<ConfigResponse> = parse_http_json(raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_http_json_rejects_garbage() {
        let result: Result<ConfigResponse> = parse_http_json(b"not http at all");
        assert!(result.is_err());
    }

    #[test]
    fn test_log_stream_chunked_encoding() {
        let mut buf = Vec::new();
        {
            let mut stream = LogStream::open(&mut buf).unwrap();
            stream.write_chunk(b"hello\n").unwrap();
            stream.write_chunk(b"").unwrap();
            stream.close().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("POST /logs HTTP/1.1\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked"));
        assert!(text.contains("6\r\nhello\n\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }
}
