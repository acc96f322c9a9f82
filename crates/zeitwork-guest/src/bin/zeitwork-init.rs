//! PID 1 inside every zeitwork microVM. Runs from the kernel initramfs:
//! mounts the customer root, fetches runtime config from the host over
//! vsock, pivots into the customer filesystem, and supervises the
//! customer process. When the customer exits, the VM powers off — the
//! host treats power-off as the end of the VM lifecycle.

#[cfg(target_os = "linux")]
fn main() {
    if let Err(e) = linux::run() {
        println!("[zeitwork-init] FATAL: {:#}", e);
        // Leave the error on the console long enough to be captured.
        std::thread::sleep(std::time::Duration::from_secs(3));
    }
    zeitwork_guest::sysinit::power_off();
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("zeitwork-init only runs inside a Linux microVM");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io::Read;
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};

    use anyhow::{Context, Result};

    use zeitwork_core::protocol::{ConfigResponse, PROCESS_SPEC_PATH, ProcessSpec, VM_EXEC_PORT};
    use zeitwork_guest::exec_server::{self, ExecTarget};
    use zeitwork_guest::process::{self, merge_env};
    use zeitwork_guest::sysinit;
    use zeitwork_guest::vsock::{self, VsockListener, VsockStream};

    /// Customer root mount point while still inside the initramfs.
    const NEWROOT: &str = "/newroot";

    /// The exec shim's path inside the customer root.
    const SPAWN_PATH: &str = "/.zeitwork/spawn";

    pub fn run() -> Result<()> {
        println!("[zeitwork-init] booting");

        sysinit::mount_pseudo_filesystems()?;
        sysinit::mount_customer_root("/dev/vda", NEWROOT)?;

        let spec = process::load_spec(
            &std::path::Path::new(NEWROOT).join(PROCESS_SPEC_PATH.trim_start_matches('/')),
        )?;

        let config = vsock::fetch_config()?;
        println!(
            "[zeitwork-init] config: ip={} gw={} hostname={}",
            config.ip_addr, config.ip_gw, config.hostname
        );

        sysinit::configure_network(&config.ip_addr, &config.ip_gw)?;
        sysinit::set_hostname(&config.hostname)?;

        // The shim is the only binary that crosses from the initramfs into
        // the customer filesystem.
        sysinit::bind_file("/zeitwork-spawn", &format!("{}{}", NEWROOT, SPAWN_PATH))?;

        sysinit::move_mount("/dev", &format!("{}/dev", NEWROOT))?;
        sysinit::move_mount("/proc", &format!("{}/proc", NEWROOT))?;
        sysinit::move_mount("/sys", &format!("{}/sys", NEWROOT))?;
        sysinit::enter_root(NEWROOT)?;

        std::fs::create_dir_all("/dev/pts").ok();
        sysinit::mount("devpts", "/dev/pts", "devpts", 0, None)?;
        sysinit::write_resolv_conf("/etc/resolv.conf")?;

        let env = merge_env(&spec.env, &config.env);
        let mut log_stream = vsock::open_log_stream()?;

        let launched = launch_customer(&spec, &env, &config)?;
        println!(
            "[zeitwork-init] customer started (supervisor pid {}, worker pid {})",
            launched.child_pid, launched.worker_pid
        );

        // Exec endpoint, joined to the customer namespaces via the worker
        // pid.
        {
            let target = ExecTarget {
                namespace_pid: Some(launched.worker_pid),
                uid: spec.uid,
                gid: spec.gid,
                env: env.clone(),
            };
            let listener = VsockListener::bind(VM_EXEC_PORT)?;
            std::thread::spawn(move || {
                if let Err(e) = exec_server::serve(listener, target) {
                    println!("[zeitwork-init] exec server stopped: {:#}", e);
                }
            });
        }

        // Tee customer stdio into the host log stream until EOF (both
        // write ends close when the customer tree is gone).
        let mut output = VsockStream::from_owned_fd(launched.stdio_read);
        let mut buf = [0u8; 8192];
        loop {
            match output.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = log_stream.write_chunk(&buf[..n]);
                }
            }
        }

        let exit = wait_for(launched.child_pid);
        println!("[zeitwork-init] customer exited with {}", exit);
        let _ = log_stream.close();
        Ok(())
    }

    struct Launched {
        /// Supervisor child in our namespaces.
        child_pid: i32,
        /// Worker inside the new PID+mount namespaces (pid as seen from
        /// ours, usable for /proc/<pid>/ns joins).
        worker_pid: i32,
        /// Read end of the merged stdout/stderr pipe.
        stdio_read: OwnedFd,
    }

    /// Start the customer process tree: a supervisor child unshares new
    /// PID+mount namespaces, forks the worker into them, and forwards its
    /// exit status. The worker execs the shim, which mounts /proc, drops
    /// privileges, and execve's the customer command.
    fn launch_customer(spec: &ProcessSpec, env: &[String], _config: &ConfigResponse) -> Result<Launched> {
        let mut stdio_fds = [0 as RawFd; 2];
        let mut pid_fds = [0 as RawFd; 2];
        // SAFETY: two pipes, then a double fork. The child only runs
        // exec-safe code.
        unsafe {
            anyhow::ensure!(libc::pipe(stdio_fds.as_mut_ptr()) == 0, "stdio pipe failed");
            anyhow::ensure!(libc::pipe(pid_fds.as_mut_ptr()) == 0, "pid pipe failed");

            let child = libc::fork();
            anyhow::ensure!(child >= 0, "fork failed");

            if child == 0 {
                // Supervisor child.
                libc::close(stdio_fds[0]);
                libc::close(pid_fds[0]);

                if libc::unshare(libc::CLONE_NEWPID | libc::CLONE_NEWNS) != 0 {
                    libc::_exit(127);
                }

                let worker = libc::fork();
                if worker < 0 {
                    libc::_exit(127);
                }

                if worker == 0 {
                    // Worker: first process of the new PID namespace.
                    libc::close(pid_fds[1]);
                    libc::dup2(stdio_fds[1], 1);
                    libc::dup2(stdio_fds[1], 2);
                    libc::close(stdio_fds[1]);
                    exec_shim(spec, env);
                    libc::_exit(127);
                }

                // Report the worker pid (valid in the parent namespace) to
                // init, then forward the worker's exit status.
                let pid_bytes = worker.to_be_bytes();
                libc::write(
                    pid_fds[1],
                    pid_bytes.as_ptr() as *const libc::c_void,
                    pid_bytes.len(),
                );
                libc::close(pid_fds[1]);
                libc::close(stdio_fds[1]);

                let mut status = 0;
                libc::waitpid(worker, &mut status, 0);
                if libc::WIFEXITED(status) {
                    libc::_exit(libc::WEXITSTATUS(status));
                }
                libc::_exit(128 + libc::WTERMSIG(status));
            }

            // Init side.
            libc::close(stdio_fds[1]);
            libc::close(pid_fds[1]);

            let mut pid_buf = [0u8; 4];
            let mut pid_pipe = OwnedFd::from_raw_fd(pid_fds[0]);
            read_exact_fd(&mut pid_pipe, &mut pid_buf)
                .with_context(|| "Failed to learn worker pid")?;
            let worker_pid = i32::from_be_bytes(pid_buf);

            Ok(Launched {
                child_pid: child,
                worker_pid,
                stdio_read: OwnedFd::from_raw_fd(stdio_fds[0]),
            })
        }
    }

    /// exec the shim: `/.zeitwork/spawn --uid U --gid G --cwd DIR -- cmd...`.
    /// Only called in the worker between fork and a failure `_exit`.
    fn exec_shim(spec: &ProcessSpec, env: &[String]) {
        let mut args: Vec<String> = vec![
            SPAWN_PATH.to_string(),
            "--uid".to_string(),
            spec.uid.to_string(),
            "--gid".to_string(),
            spec.gid.to_string(),
            "--cwd".to_string(),
            spec.cwd.clone(),
            "--".to_string(),
        ];
        args.extend(spec.args.iter().cloned());

        let Ok((_argv_owned, argv)) = exec_server::to_exec_argv(&args) else {
            return;
        };
        let env = if env.is_empty() {
            vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()]
        } else {
            env.to_vec()
        };
        let Ok((_env_owned, envp)) = exec_server::to_exec_argv(&env) else {
            return;
        };
        // SAFETY: execve with NULL-terminated arrays backed by the owned
        // CStrings above.
        unsafe {
            libc::execve(argv[0], argv.as_ptr(), envp.as_ptr());
        }
    }

    fn read_exact_fd(fd: &mut OwnedFd, buf: &mut [u8]) -> Result<()> {
        use std::io::Read;
        let mut stream = VsockStream::from_owned_fd(fd.try_clone()?);
        stream.read_exact(buf).with_context(|| "short read")?;
        Ok(())
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
}
