//! Guest-side `/exec` endpoint: accepts framed sessions from the host,
//! launches the requested command joined to the customer's namespaces,
//! and pumps bytes until the child exits.

use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use zeitwork_core::protocol::{
    self, ExecControl, ExecRequest, Frame, FrameKind, WindowSize,
};

/// What a session needs to know about the customer environment.
#[derive(Debug, Clone)]
pub struct ExecTarget {
    /// Pid (in our namespace) of a process inside the customer PID+mount
    /// namespaces, or None before the customer process is up.
    pub namespace_pid: Option<i32>,
    pub uid: u32,
    pub gid: u32,
    /// Environment handed to exec'd commands.
    pub env: Vec<String>,
}

/// Convert command args into the NULL-terminated pointer array execvp
/// wants. The CStrings must outlive the returned pointers.
pub fn to_exec_argv(args: &[String]) -> Result<(Vec<CString>, Vec<*const libc::c_char>)> {
    anyhow::ensure!(!args.is_empty(), "Empty exec command");
    let owned: Vec<CString> = args
        .iter()
        .map(|a| CString::new(a.as_str()).with_context(|| format!("NUL in argument {:?}", a)))
        .collect::<Result<_>>()?;
    let mut ptrs: Vec<*const libc::c_char> = owned.iter().map(|c| c.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    Ok((owned, ptrs))
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::process::drop_privileges;
    use crate::vsock::{VsockListener, VsockStream};
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};

    /// Serve exec sessions forever; one thread per session.
    pub fn serve(listener: VsockListener, target: ExecTarget) -> Result<()> {
        loop {
            let stream = listener.accept()?;
            let target = target.clone();
            std::thread::spawn(move || {
                if let Err(e) = handle_session(stream, &target) {
                    tracing::warn!(error = %e, "Exec session failed");
                }
            });
        }
    }

    struct Pty {
        master: OwnedFd,
        slave: OwnedFd,
    }

    fn open_pty() -> Result<Pty> {
        let mut master: RawFd = -1;
        let mut slave: RawFd = -1;
        // SAFETY: openpty fills the two fds on success.
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| "openpty failed");
        }
        // SAFETY: fresh fds owned by us.
        unsafe {
            Ok(Pty {
                master: OwnedFd::from_raw_fd(master),
                slave: OwnedFd::from_raw_fd(slave),
            })
        }
    }

    fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: pipe fills both fds on success.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| "pipe failed");
        }
        // SAFETY: fresh fds owned by us.
        unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
    }

    fn resize_pty(master: RawFd, size: WindowSize) {
        let ws = libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: ioctl on a live master fd with a stack-local winsize.
        unsafe {
            libc::ioctl(master, libc::TIOCSWINSZ, &ws);
        }
    }

    /// Join the customer's mount and PID namespaces.
    fn join_namespaces(ns_pid: i32) -> Result<()> {
        for ns in ["mnt", "pid"] {
            let path = CString::new(format!("/proc/{}/ns/{}", ns_pid, ns))?;
            // SAFETY: open + setns on a path we just built.
            unsafe {
                let fd = libc::open(path.as_ptr(), libc::O_RDONLY);
                if fd < 0 {
                    return Err(std::io::Error::last_os_error())
                        .with_context(|| format!("open ns {} of pid {} failed", ns, ns_pid));
                }
                let rc = libc::setns(fd, 0);
                libc::close(fd);
                if rc != 0 {
                    return Err(std::io::Error::last_os_error())
                        .with_context(|| format!("setns {} of pid {} failed", ns, ns_pid));
                }
            }
        }
        Ok(())
    }

    /// Fork and exec the requested command with stdio wired to `stdio_fd`
    /// (PTY slave or pipe ends). Returns the direct child pid.
    ///
    /// The child joins the customer namespaces first; after joining the
    /// PID namespace it must fork once more so the kernel places the
    /// worker inside it, hence child → grandchild, with the child
    /// forwarding the grandchild's exit status.
    fn spawn_child(
        request: &ExecRequest,
        target: &ExecTarget,
        stdin_fd: RawFd,
        stdout_fd: RawFd,
        stderr_fd: RawFd,
        set_controlling_tty: bool,
    ) -> Result<i32> {
        let (argv_owned, argv) = to_exec_argv(&request.command)?;
        let mut env: Vec<String> = target.env.clone();
        if let Some(extra) = &request.env {
            env.extend_from_slice(extra);
        }
        let (env_owned, envp) = to_exec_argv(&if env.is_empty() {
            vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()]
        } else {
            env
        })?;

        // SAFETY: fork/exec dance; the child only calls async-signal-safe
        // functions (raw syscalls) before execve.
        unsafe {
            let pid = libc::fork();
            if pid < 0 {
                return Err(std::io::Error::last_os_error()).with_context(|| "fork failed");
            }
            if pid > 0 {
                drop(argv_owned);
                drop(env_owned);
                return Ok(pid);
            }

            // Child. Lead a fresh process group so kill_group(-pid) takes
            // the whole command tree down. Best effort from here on: any
            // failure exits 127.
            libc::setsid();
            if let Some(ns_pid) = target.namespace_pid {
                if join_namespaces(ns_pid).is_err() {
                    libc::_exit(127);
                }
            }

            let worker = libc::fork();
            if worker < 0 {
                libc::_exit(127);
            }
            if worker > 0 {
                // Forward the worker's exit status.
                let mut status = 0;
                libc::waitpid(worker, &mut status, 0);
                if libc::WIFEXITED(status) {
                    libc::_exit(libc::WEXITSTATUS(status));
                }
                libc::_exit(128 + libc::WTERMSIG(status));
            }

            // Grandchild: the actual command. A controlling TTY needs its
            // own session; in pipe mode the grandchild stays in the
            // child's group so the group kill reaches it.
            libc::dup2(stdin_fd, 0);
            libc::dup2(stdout_fd, 1);
            libc::dup2(stderr_fd, 2);
            if set_controlling_tty {
                libc::setsid();
                libc::ioctl(0, libc::TIOCSCTTY, 0);
            }
            if drop_privileges(target.uid, target.gid).is_err() {
                libc::_exit(126);
            }
            libc::execvpe(argv[0], argv.as_ptr(), envp.as_ptr());
            libc::_exit(127);
        }
    }

    fn wait_for(pid: i32) -> i32 {
        let mut status = 0;
        // SAFETY: waitpid on our own child.
        unsafe {
            libc::waitpid(pid, &mut status, 0);
            if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else {
                128 + libc::WTERMSIG(status)
            }
        }
    }

    fn kill_group(pid: i32) {
        // The child called setsid, so its process group id is its pid.
        // SAFETY: signal to the session's group only.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }

    fn handle_session(mut stream: VsockStream, target: &ExecTarget) -> Result<()> {
        let opening = protocol::read_frame_blocking(&mut stream)?;
        let request: ExecRequest = opening.parse_control()?;
        tracing::info!(command = ?request.command, tty = request.tty, "Exec session");

        if request.tty {
            run_tty_session(stream, &request, target)
        } else {
            run_pipe_session(stream, &request, target)
        }
    }

    fn run_tty_session(stream: VsockStream, request: &ExecRequest, target: &ExecTarget) -> Result<()> {
        use std::os::fd::AsRawFd;

        let pty = open_pty()?;
        let pid = spawn_child(
            request,
            target,
            pty.slave.as_raw_fd(),
            pty.slave.as_raw_fd(),
            pty.slave.as_raw_fd(),
            true,
        )?;
        drop(pty.slave);

        let master_fd = pty.master.as_raw_fd();
        let writer = Arc::new(Mutex::new(stream.try_clone()?));

        // PTY output → binary frames.
        let out_writer = Arc::clone(&writer);
        let mut master_read = VsockStream::from_owned_fd(pty.master.try_clone()?);
        let pump = std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match master_read.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = Frame::binary(buf[..n].to_vec());
                        let mut w = out_writer.lock().expect("writer lock");
                        if protocol::write_frame_blocking(&mut *w, &frame).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Inbound frames: binary → PTY, resize controls → TIOCSWINSZ.
        let mut master_write = VsockStream::from_owned_fd(pty.master.try_clone()?);
        let mut reader = stream;
        let inbound = std::thread::spawn(move || {
            loop {
                let frame = match protocol::read_frame_blocking(&mut reader) {
                    Ok(f) => f,
                    Err(_) => break,
                };
                match frame.kind {
                    FrameKind::Binary => {
                        if master_write.write_all(&frame.payload).is_err() {
                            break;
                        }
                    }
                    FrameKind::Text => {
                        if let Ok(ExecControl::Resize { resize }) = frame.parse_control() {
                            resize_pty(master_fd, resize);
                        }
                    }
                }
            }
        });

        let exit = wait_for(pid);
        // Closing the master unblocks the pump; the host closing its end
        // unblocks the inbound thread.
        drop(pty.master);
        let _ = pump.join();

        let exit_frame = Frame::control(&ExecControl::Exit { exit })?;
        if let Ok(mut w) = writer.lock() {
            let _ = protocol::write_frame_blocking(&mut *w, &exit_frame);
        }
        kill_group(pid);
        let _ = inbound.join();
        Ok(())
    }

    fn run_pipe_session(stream: VsockStream, request: &ExecRequest, target: &ExecTarget) -> Result<()> {
        use std::os::fd::AsRawFd;

        let (stdin_read, stdin_write) = pipe_pair()?;
        // stdout and stderr merge into one return stream.
        let (out_read, out_write) = pipe_pair()?;

        let pid = spawn_child(
            request,
            target,
            stdin_read.as_raw_fd(),
            out_write.as_raw_fd(),
            out_write.as_raw_fd(),
            false,
        )?;
        drop(stdin_read);
        drop(out_write);

        let writer = Arc::new(Mutex::new(stream.try_clone()?));

        let out_writer = Arc::clone(&writer);
        let mut out_stream = VsockStream::from_owned_fd(out_read);
        let pump = std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match out_stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = Frame::binary(buf[..n].to_vec());
                        let mut w = out_writer.lock().expect("writer lock");
                        if protocol::write_frame_blocking(&mut *w, &frame).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut stdin_stream = VsockStream::from_owned_fd(stdin_write);
        let mut reader = stream;
        let inbound = std::thread::spawn(move || {
            loop {
                let frame = match protocol::read_frame_blocking(&mut reader) {
                    Ok(f) => f,
                    Err(_) => break,
                };
                if frame.kind == FrameKind::Binary
                    && stdin_stream.write_all(&frame.payload).is_err()
                {
                    break;
                }
            }
            // Dropping stdin_stream closes the child's stdin.
        });

        let exit = wait_for(pid);
        let _ = pump.join();

        let exit_frame = Frame::control(&ExecControl::Exit { exit })?;
        if let Ok(mut w) = writer.lock() {
            let _ = protocol::write_frame_blocking(&mut *w, &exit_frame);
        }
        kill_group(pid);
        let _ = inbound.join();
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use linux::serve;

#[cfg(not(target_os = "linux"))]
pub fn serve(_listener: (), _target: ExecTarget) -> Result<()> {
    anyhow::bail!("Exec sessions require a Linux guest")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_exec_argv_null_terminated() {
        let (owned, ptrs) = to_exec_argv(&["ls".to_string(), "-la".to_string()]).unwrap();
        assert_eq!(owned.len(), 2);
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
        assert!(!ptrs[0].is_null());
    }

    #[test]
    fn test_to_exec_argv_rejects_empty() {
        assert!(to_exec_argv(&[]).is_err());
    }

    #[test]
    fn test_to_exec_argv_rejects_interior_nul() {
        assert!(to_exec_argv(&["bad\0arg".to_string()]).is_err());
    }
}
