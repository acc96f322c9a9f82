//! Exec shim: the only path by which customer code is launched. Runs as
//! the first process of a fresh PID+mount namespace, mounts /proc for it,
//! drops privileges in the required order, and execve's the target.
//!
//! Usage: zeitwork-spawn --uid U --gid G --cwd DIR -- command [args...]

#[cfg(target_os = "linux")]
fn main() {
    match linux::run() {
        Ok(never) => match never {},
        Err(e) => {
            eprintln!("[zeitwork-spawn] {:#}", e);
            std::process::exit(127);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("zeitwork-spawn only runs inside a Linux microVM");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
mod linux {
    use anyhow::{Context, Result, bail};

    use zeitwork_guest::exec_server::to_exec_argv;
    use zeitwork_guest::process::drop_privileges;
    use zeitwork_guest::sysinit;

    pub enum Never {}

    #[derive(Debug)]
    struct Args {
        uid: u32,
        gid: u32,
        cwd: String,
        command: Vec<String>,
    }

    fn parse_args(raw: &[String]) -> Result<Args> {
        let mut uid = None;
        let mut gid = None;
        let mut cwd = "/".to_string();
        let mut command = Vec::new();

        let mut iter = raw.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--uid" => {
                    uid = Some(
                        iter.next()
                            .with_context(|| "--uid needs a value")?
                            .parse()
                            .with_context(|| "--uid must be numeric")?,
                    );
                }
                "--gid" => {
                    gid = Some(
                        iter.next()
                            .with_context(|| "--gid needs a value")?
                            .parse()
                            .with_context(|| "--gid must be numeric")?,
                    );
                }
                "--cwd" => {
                    cwd = iter.next().with_context(|| "--cwd needs a value")?.clone();
                }
                "--" => {
                    command = iter.cloned().collect();
                    break;
                }
                other => bail!("Unknown argument: {}", other),
            }
        }

        let uid = uid.with_context(|| "--uid is required")?;
        let gid = gid.with_context(|| "--gid is required")?;
        if command.is_empty() {
            bail!("No command after --");
        }
        Ok(Args { uid, gid, cwd, command })
    }

    pub fn run() -> Result<Never> {
        let raw: Vec<String> = std::env::args().skip(1).collect();
        let args = parse_args(&raw)?;

        // Fresh /proc for the new PID namespace; without it the customer
        // sees the namespace's pids through a stale view or nothing.
        std::fs::create_dir_all("/proc").ok();
        sysinit::mount("proc", "/proc", "proc", 0, None)?;

        std::env::set_current_dir(&args.cwd)
            .with_context(|| format!("Failed to chdir to {}", args.cwd))?;

        drop_privileges(args.uid, args.gid)?;

        let (_argv_owned, argv) = to_exec_argv(&args.command)?;
        // SAFETY: execvp with a NULL-terminated argv backed by live
        // CStrings; does not return on success.
        unsafe {
            libc::execvp(argv[0], argv.as_ptr());
        }
        Err(std::io::Error::last_os_error())
            .with_context(|| format!("execvp {:?} failed", args.command[0]))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn strs(args: &[&str]) -> Vec<String> {
            args.iter().map(|s| s.to_string()).collect()
        }

        #[test]
        fn test_parse_full_args() {
            let args = parse_args(&strs(&[
                "--uid", "1000", "--gid", "1000", "--cwd", "/app", "--", "/app/server", "--port",
                "8080",
            ]))
            .unwrap();
            assert_eq!(args.uid, 1000);
            assert_eq!(args.gid, 1000);
            assert_eq!(args.cwd, "/app");
            assert_eq!(args.command, strs(&["/app/server", "--port", "8080"]));
        }

        #[test]
        fn test_parse_defaults_cwd() {
            let args = parse_args(&strs(&["--uid", "0", "--gid", "0", "--", "sh"])).unwrap();
            assert_eq!(args.cwd, "/");
        }

        #[test]
        fn test_parse_rejects_missing_command() {
            assert!(parse_args(&strs(&["--uid", "0", "--gid", "0"])).is_err());
            assert!(parse_args(&strs(&["--uid", "0", "--gid", "0", "--"])).is_err());
        }

        #[test]
        fn test_parse_rejects_unknown_flag() {
            assert!(parse_args(&strs(&["--nope", "--", "sh"])).is_err());
        }

        #[test]
        fn test_parse_requires_ids() {
            assert!(parse_args(&strs(&["--", "sh"])).is_err());
        }
    }
}
