// zeitwork-proxy: stateless TLS-terminating edge. Routing state is a
// rebuildable in-memory table derived from one database join; certificates
// come from the shared cert store with notification-driven cache refresh.

pub mod config;
pub mod routes;
pub mod server;
pub mod tls;
