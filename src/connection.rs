// ABOUTME: Owns one client/backend socket pair, forwards frames, and enforces reconciliation
// ABOUTME: One independent tokio task per connection; pending is never shared across tasks

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::frame::{self, FrameHeader};
use crate::keepalive;
use crate::pending::{PendingEntry, PendingQueue};
use crate::policy::{self, Action};

#[derive(Debug, Default, Clone, Copy)]
struct Stats {
    up_bytes: u64,
    up_frames: u64,
    down_bytes: u64,
    down_frames: u64,
}

/// Owns one accepted client connection and its dialed backend connection for
/// its entire lifetime. Created by the accept loop with a pre-assigned,
/// monotonically increasing connection id; destroyed when [`ConnectionPipe::run`]
/// returns, at which point both sockets are closed and a final summary has
/// been logged.
pub struct ConnectionPipe {
    id: u64,
    client: TcpStream,
    backend: TcpStream,
    cfg: Arc<Config>,
    pending: PendingQueue,
    stats: Stats,
    started_at: Instant,
}

impl ConnectionPipe {
    pub fn new(id: u64, client: TcpStream, backend: TcpStream, cfg: Arc<Config>) -> Self {
        Self {
            id,
            client,
            backend,
            cfg,
            pending: PendingQueue::new(),
            stats: Stats::default(),
            started_at: Instant::now(),
        }
    }

    /// Run the forward/reconcile loop until either peer closes or errors.
    /// Never returns an error: every failure path is logged and the
    /// connection is torn down here, matching the "no error is propagated
    /// across connection boundaries" rule.
    pub async fn run(mut self) {
        if let Err(e) = keepalive::tune(&self.client) {
            warn!(conn = self.id, error = %e, "failed to tune client socket keepalive");
        }
        if let Err(e) = keepalive::tune(&self.backend) {
            warn!(conn = self.id, error = %e, "failed to tune backend socket keepalive");
        }

        let mut client_buf = vec![0u8; self.cfg.buffer_size];
        let mut backend_buf = vec![0u8; self.cfg.buffer_size];
        let sock_timeout = Duration::from_secs(self.cfg.sock_timeout_s.max(1));
        let mut stats_interval = (self.cfg.log_stats_interval > 0)
            .then(|| tokio::time::interval(Duration::from_secs(self.cfg.log_stats_interval)));

        loop {
            let idle = tokio::time::sleep(sock_timeout);
            let tick = async {
                match stats_interval.as_mut() {
                    Some(iv) => {
                        iv.tick().await;
                        true
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                res = self.client.read(&mut client_buf) => {
                    match res {
                        Ok(0) => {
                            info!(conn = self.id, "client closed connection (EOF)");
                            break;
                        }
                        Ok(n) => {
                            if !self.handle_client_chunk(&client_buf[..n]).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(conn = self.id, error = %e, "client read error");
                            break;
                        }
                    }
                }
                res = self.backend.read(&mut backend_buf) => {
                    match res {
                        Ok(0) => {
                            info!(conn = self.id, "backend closed connection (EOF)");
                            break;
                        }
                        Ok(n) => {
                            if !self.handle_backend_chunk(&backend_buf[..n]).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(conn = self.id, error = %e, "backend read error");
                            break;
                        }
                    }
                }
                _ = idle => {
                    debug!(conn = self.id, "idle");
                }
                fired = tick => {
                    if fired {
                        self.log_periodic_stats();
                    }
                }
            }
        }

        self.teardown().await;
    }

    /// Returns `false` if the connection should close (write error).
    async fn handle_client_chunk(&mut self, chunk: &[u8]) -> bool {
        self.stats.up_bytes += chunk.len() as u64;
        self.stats.up_frames += 1;

        if let Some(header) = frame::parse_header(chunk) {
            self.pending.push(PendingEntry { tid: header.tid, uid: header.uid, func: header.func });
            self.log_frame('C', '>', "W", chunk, &header);
        }

        if let Err(e) = self.backend.write_all(chunk).await {
            warn!(conn = self.id, error = %e, "write to backend failed");
            return false;
        }
        true
    }

    /// Returns `false` if the connection should close (write error).
    async fn handle_backend_chunk(&mut self, chunk: &[u8]) -> bool {
        self.stats.down_bytes += chunk.len() as u64;
        self.stats.down_frames += 1;

        let Some(header) = frame::parse_header(chunk) else {
            // No header to reconcile against; pass the chunk through as-is,
            // per the data model invariant that header-dependent logic is
            // skipped when the buffer is too short to parse.
            if let Err(e) = self.client.write_all(chunk).await {
                warn!(conn = self.id, error = %e, "write to client failed");
                return false;
            }
            return true;
        };

        self.log_frame('W', '>', "C", chunk, &header);

        if let Some((resp_uid, expected_uid, tid)) = policy::uid_mismatch(&self.pending, &self.cfg, header) {
            warn!(
                conn = self.id,
                resp_uid, expected_uid, tid,
                "uid_mismatch resp_uid={resp_uid} expected_uid={expected_uid} tid={tid}"
            );
        }

        let decision = policy::reconcile(&mut self.pending, &self.cfg, header);
        if decision.anomaly_loggable {
            self.log_anomaly(decision.anomaly);
        }

        let outgoing = match decision.action {
            Action::Discard => return true,
            Action::Forward => std::borrow::Cow::Borrowed(chunk),
            Action::ForwardRewritten(new_tid) => std::borrow::Cow::Owned(frame::rewrite_tid(chunk, new_tid).to_vec()),
        };

        if let Err(e) = self.client.write_all(&outgoing).await {
            warn!(conn = self.id, error = %e, "write to client failed");
            return false;
        }
        true
    }

    fn log_anomaly(&self, anomaly: Option<policy::Anomaly>) {
        use policy::Anomaly;
        match anomaly {
            Some(Anomaly::StrayResponse { b_tid, expected: None }) => {
                warn!(conn = self.id, tid = b_tid, "stray_response tid={b_tid}");
            }
            Some(Anomaly::StrayResponse { b_tid, expected: Some(exp) }) => {
                warn!(
                    conn = self.id, tid = b_tid, expected = exp,
                    "stray_response tid={b_tid} expected={exp}"
                );
            }
            Some(Anomaly::TidMismatch { expected, got, pending_len }) => {
                warn!(
                    conn = self.id, expected, got, pending = pending_len,
                    "tid_mismatch expected={expected} got={got} pending={pending_len}"
                );
            }
            Some(Anomaly::TidRewrite { from, to }) => {
                info!(conn = self.id, from, to, "tid_rewrite {from}\u{2192}{to}");
            }
            None => {}
        }
    }

    fn log_frame(&self, from: char, arrow: char, to: &str, chunk: &[u8], header: &FrameHeader) {
        if self.cfg.log_hexdump {
            let cap = self.cfg.log_sample_bytes.min(chunk.len());
            let hex: Vec<String> = chunk[..cap].iter().map(|b| format!("{b:02X}")).collect();
            debug!(
                conn = self.id,
                "[conn-{}] {}{}{} len={} tid={} uid={} func={} {}",
                self.id, from, arrow, to, chunk.len(), header.tid, header.uid, header.func, hex.join(" ")
            );
        } else {
            debug!(
                conn = self.id,
                "[conn-{}] {}{}{} len={} tid={} uid={} func={}",
                self.id, from, arrow, to, chunk.len(), header.tid, header.uid, header.func
            );
        }
    }

    fn log_periodic_stats(&self) {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        info!(
            conn = self.id,
            up_bytes = self.stats.up_bytes,
            up_frames = self.stats.up_frames,
            down_bytes = self.stats.down_bytes,
            down_frames = self.stats.down_frames,
            elapsed_s = elapsed,
            "[conn-{}] stats up_bytes={} up_frames={} down_bytes={} down_frames={} elapsed_s={:.1}",
            self.id, self.stats.up_bytes, self.stats.up_frames, self.stats.down_bytes, self.stats.down_frames, elapsed
        );
    }

    async fn teardown(mut self) {
        if !self.pending.is_empty() {
            let unanswered = self.pending.unanswered_tids();
            warn!(
                conn = self.id,
                pending = unanswered.len(),
                "closing with pending={} (unanswered tids: {:?})",
                unanswered.len(), unanswered
            );
        }

        let elapsed = self.started_at.elapsed().as_secs_f64();
        info!(
            conn = self.id,
            up_bytes = self.stats.up_bytes,
            up_frames = self.stats.up_frames,
            down_bytes = self.stats.down_bytes,
            down_frames = self.stats.down_frames,
            elapsed_s = elapsed,
            "[conn-{}] closed up_bytes={} up_frames={} down_bytes={} down_frames={} elapsed_s={:.1}",
            self.id, self.stats.up_bytes, self.stats.up_frames, self.stats.down_bytes, self.stats.down_frames, elapsed
        );

        let _ = self.client.shutdown().await;
        let _ = self.backend.shutdown().await;
    }
}
