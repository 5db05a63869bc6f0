// ABOUTME: Reconciliation policy for backend->client frames against the pending FIFO
// ABOUTME: Implements the decision table from the design: strict / rewrite / tolerant

use crate::config::Config;
use crate::frame::FrameHeader;
use crate::pending::{PendingEntry, PendingQueue};

/// What the connection pipe should do with a backend response frame once the
/// policy has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Forward the frame's bytes unchanged.
    Forward,
    /// Forward the frame with bytes 0..=1 rewritten to this tid.
    ForwardRewritten(u16),
    /// Drop the frame; nothing is sent to the client.
    Discard,
}

/// A log-worthy anomaly surfaced by the policy, carrying the literal token
/// the structured logger and the log metrics scanner key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// No pending entry at all, or pending non-empty but tid mismatched with
    /// `tid_rewrite` and `tid_strict` both off.
    StrayResponse { b_tid: u16, expected: Option<u16> },
    /// Head mismatched, diagnostic mode (`tid_strict=1, tid_rewrite=0`).
    TidMismatch { expected: u16, got: u16, pending_len: usize },
    /// Head mismatched, rewrite mode popped the head and relabeled the frame.
    TidRewrite { from: u16, to: u16 },
}

/// Outcome of applying the tid reconciliation policy to one backend response.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub action: Action,
    /// Anomaly to log, if any. `None` when the response matched the pending
    /// head cleanly.
    pub anomaly: Option<Anomaly>,
    /// Whether `anomaly` should actually be written to the log; suppressed by
    /// `drop_stray_silent` for `StrayResponse`/`TidMismatch` only (the action
    /// itself is never affected). `TidRewrite` is always logged.
    pub anomaly_loggable: bool,
}

/// Apply the tid reconciliation policy to a backend response, mutating
/// `pending` as required (popping the head on a match or a rewrite).
///
/// `strict_uid`'s uid warning is orthogonal to this decision (it never
/// changes `action`) and is checked separately via [`uid_mismatch`], which
/// the caller consults before or after this call using the same pending head.
pub fn reconcile(pending: &mut PendingQueue, cfg: &Config, resp: FrameHeader) -> Decision {
    let head = match pending.head().copied() {
        None => {
            let action = if cfg.pass_stray { Action::Forward } else { Action::Discard };
            return Decision {
                action,
                anomaly: Some(Anomaly::StrayResponse { b_tid: resp.tid, expected: None }),
                anomaly_loggable: !cfg.drop_stray_silent,
            };
        }
        Some(head) => head,
    };

    if head.tid == resp.tid {
        pending.pop();
        return Decision { action: Action::Forward, anomaly: None, anomaly_loggable: true };
    }

    match (cfg.tid_rewrite, cfg.tid_strict) {
        (true, _) => {
            pending.pop();
            Decision {
                action: Action::ForwardRewritten(head.tid),
                anomaly: Some(Anomaly::TidRewrite { from: resp.tid, to: head.tid }),
                anomaly_loggable: true,
            }
        }
        (false, true) => Decision {
            action: if cfg.pass_stray { Action::Forward } else { Action::Discard },
            anomaly: Some(Anomaly::TidMismatch {
                expected: head.tid,
                got: resp.tid,
                pending_len: pending.len(),
            }),
            anomaly_loggable: !cfg.drop_stray_silent,
        },
        (false, false) => Decision {
            action: if cfg.pass_stray { Action::Forward } else { Action::Discard },
            anomaly: Some(Anomaly::StrayResponse { b_tid: resp.tid, expected: Some(head.tid) }),
            anomaly_loggable: !cfg.drop_stray_silent,
        },
    }
}

/// `strict_uid` warning: true when the response's uid differs from the
/// current pending head's uid and both are known. Never suppressed by
/// `drop_stray_silent`, and never changes `reconcile`'s action.
pub fn uid_mismatch(
    pending: &PendingQueue,
    cfg: &Config,
    resp: FrameHeader,
) -> Option<(u8, u8, u16)> {
    if !cfg.strict_uid {
        return None;
    }
    let head: PendingEntry = *pending.head()?;
    (head.uid != resp.uid).then_some((resp.uid, head.uid, head.tid))
}
