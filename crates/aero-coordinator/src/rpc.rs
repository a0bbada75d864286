//! Request/response bookkeeping for worker RPCs.
//!
//! One map per worker role, keyed by request id. A worker that terminates
//! takes all of its pending requests with it: each handle is rejected with
//! the same canonical error so callers can match on it regardless of which
//! request was in flight.

use std::collections::HashMap;

use aero_pcapng::TraceStats;
use tokio::sync::oneshot;

use crate::worker::WorkerRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    NetTraceTake,
    NetTraceExport,
    NetTraceStatus,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RpcError {
    /// Canonical rejection for every request pending against a worker that
    /// went away; e.g. `"net worker restarted"`.
    #[error("{role} worker restarted")]
    WorkerRestarted { role: WorkerRole },

    /// The request could not even be posted (dead worker, hostile proxy).
    #[error("{role} worker unreachable: {message}")]
    Unreachable { role: WorkerRole, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    Pcapng(Vec<u8>),
    TraceStats(TraceStats),
}

/// Await this to get the worker's response; it resolves to an error if the
/// worker restarts or the post fails.
pub type NetTraceHandle = oneshot::Receiver<Result<RpcResponse, RpcError>>;

struct PendingRpc {
    #[allow(dead_code)]
    kind: RpcKind,
    responder: oneshot::Sender<Result<RpcResponse, RpcError>>,
}

#[derive(Default)]
pub struct PendingRpcs {
    next_request_id: u64,
    by_role: HashMap<WorkerRole, HashMap<u64, PendingRpc>>,
}

impl PendingRpcs {
    /// Allocates a request id and registers the responder.
    pub fn allocate(&mut self, role: WorkerRole, kind: RpcKind) -> (u64, NetTraceHandle) {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let (tx, rx) = oneshot::channel();
        self.by_role
            .entry(role)
            .or_default()
            .insert(request_id, PendingRpc { kind, responder: tx });
        (request_id, rx)
    }

    /// Resolves one request. Returns false for unknown ids (stale response
    /// after a restart) so callers can drop them silently.
    pub fn resolve(&mut self, role: WorkerRole, request_id: u64, response: RpcResponse) -> bool {
        let Some(pending) = self.by_role.get_mut(&role).and_then(|m| m.remove(&request_id)) else {
            return false;
        };
        let _ = pending.responder.send(Ok(response));
        true
    }

    /// Rejects one request immediately (post failure).
    pub fn reject(&mut self, role: WorkerRole, request_id: u64, error: RpcError) {
        if let Some(pending) = self.by_role.get_mut(&role).and_then(|m| m.remove(&request_id)) {
            let _ = pending.responder.send(Err(error));
        }
    }

    /// Rejects everything pending against `role` with the canonical
    /// restarted error.
    pub fn reject_all(&mut self, role: WorkerRole) {
        if let Some(pending) = self.by_role.remove(&role) {
            for (_, rpc) in pending {
                let _ = rpc.responder.send(Err(RpcError::WorkerRestarted { role }));
            }
        }
    }

    pub fn pending_count(&self, role: WorkerRole) -> usize {
        self.by_role.get(&role).map_or(0, HashMap::len)
    }
}
