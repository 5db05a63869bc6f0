// ABOUTME: Applies OS-level TCP keepalive tuning to a connection's two sockets
// ABOUTME: Falls back to plain SO_KEEPALIVE where the platform has no tunable idle/interval/count

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// idle 60s, interval 10s, 9 probes where the platform exposes the knobs;
/// `socket2` degrades gracefully to `SO_KEEPALIVE` alone where it doesn't.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_RETRIES: u32 = 9;

/// Enable TCP keepalive on `stream` with the proxy's fixed tuning.
pub fn tune(stream: &TcpStream) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    sock.set_tcp_keepalive(&keepalive)?;
    sock.set_tcp_nodelay(true)?;
    Ok(())
}
