// zeitwork-agent: per-node microVM manager. Watches VM rows assigned to
// this server and materializes them as Firecracker microVMs with /31
// point-to-point networking, a vsock RPC channel, log streaming, and
// interactive exec sessions.

pub mod admin;
pub mod config;
pub mod disk;
pub mod exec;
pub mod logs;
pub mod machine;
pub mod netns;
pub mod reconcile;
pub mod vsock_host;
