// ABOUTME: Binds the listener, accepts clients, dials the backend, and spawns connection tasks
// ABOUTME: Transient accept errors are logged and retried; a dialed backend never retries

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connection::ConnectionPipe;
use crate::error::{ProxyError, ProxyResult};

const ACCEPT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
const LISTEN_BACKLOG: i32 = 50;

/// Binds the configured listen address with `SO_REUSEADDR` and the backlog
/// fixed at 50, then accepts clients forever, dialing one backend connection
/// per accepted client and spawning an independent [`ConnectionPipe`] task
/// for each pair.
///
/// Runs until `shutdown` resolves, then returns the [`JoinSet`] holding every
/// still-running connection task. The accept loop itself never awaits them —
/// per the design's "a signal-driven shutdown of the accept loop does not
/// forcibly tear down in-flight connections" rule, draining is the caller's
/// job, done by awaiting the returned set after `run` returns rather than by
/// dropping the runtime out from under them.
pub async fn run(
    cfg: Arc<Config>,
    shutdown: impl std::future::Future<Output = ()>,
) -> ProxyResult<JoinSet<()>> {
    let listener = bind_with_reuseaddr(&cfg.listen_addr())?;
    info!(addr = %cfg.listen_addr(), target = %cfg.target_addr(), "accept loop listening");

    let next_id = AtomicU64::new(1);
    let mut tasks = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(in_flight = tasks.len(), "shutdown signal received, accept loop stopping");
                return Ok(tasks);
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((client, peer_addr)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        let cfg = Arc::clone(&cfg);
                        tasks.spawn(async move {
                            accept_one(id, client, peer_addr, cfg).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error, retrying");
                        tokio::time::sleep(ACCEPT_RETRY_BACKOFF).await;
                    }
                }
            }
        }
    }
}

async fn accept_one(id: u64, client: TcpStream, peer_addr: std::net::SocketAddr, cfg: Arc<Config>) {
    info!(conn = id, peer = %peer_addr, "client connected");

    let backend = match TcpStream::connect(cfg.target_addr()).await {
        Ok(backend) => backend,
        Err(e) => {
            error!(conn = id, target = %cfg.target_addr(), error = %e, "failed to dial backend");
            return;
        }
    };

    let pipe = ConnectionPipe::new(id, client, backend, cfg);
    pipe.run().await;
}

fn bind_with_reuseaddr(addr: &str) -> ProxyResult<TcpListener> {
    let sock_addr: std::net::SocketAddr = addr.parse().map_err(|_| ProxyError::ConfigInvalid(format!("invalid listen address: {addr}")))?;
    let domain = if sock_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(|source| ProxyError::Listen { addr: addr.to_string(), source })?;
    socket.set_reuse_address(true).map_err(|source| ProxyError::Listen { addr: addr.to_string(), source })?;
    socket.set_nonblocking(true).map_err(|source| ProxyError::Listen { addr: addr.to_string(), source })?;
    socket.bind(&sock_addr.into()).map_err(|source| ProxyError::Listen { addr: addr.to_string(), source })?;
    socket.listen(LISTEN_BACKLOG).map_err(|source| ProxyError::Listen { addr: addr.to_string(), source })?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|source| ProxyError::Listen { addr: addr.to_string(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_and_allows_immediate_reuse() {
        let listener = bind_with_reuseaddr("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        // SO_REUSEADDR should let us rebind the same address right away.
        let rebind = bind_with_reuseaddr(&addr.to_string());
        assert!(rebind.is_ok());
    }

    #[tokio::test]
    async fn accept_one_closes_client_on_dial_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let (accepted, client_side) = tokio::join!(listener.accept(), connect);
        let (server_side, peer_addr) = accepted.unwrap();
        let mut client_side = client_side.unwrap();

        let cfg = Arc::new(Config {
            listen_ip: "127.0.0.1".into(),
            listen_port: 0,
            proxy_target_ip: "127.0.0.1".into(),
            proxy_target_port: 1, // nothing listens here
            buffer_size: 4096,
            sock_timeout_s: 30,
            tid_rewrite: true,
            tid_strict: false,
            strict_uid: false,
            pass_stray: false,
            drop_stray_silent: false,
            log_file: "/tmp/modbus_proxy_accept_test.log".into(),
            log_level: "INFO".into(),
            log_hexdump: false,
            log_sample_bytes: 64,
            log_stats_interval: 0,
            log_max_bytes: 5_242_880,
            log_backup_count: 5,
        });

        accept_one(1, server_side, peer_addr, cfg).await;

        // Since the backend dial failed, the client side should observe EOF.
        let mut buf = [0u8; 8];
        let n = tokio::io::AsyncReadExt::read(&mut client_side, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
