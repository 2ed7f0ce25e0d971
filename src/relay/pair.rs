//! Relay pair: one client-side stream bound to one backend-side stream.
//!
//! The pair runs two independent forwarding loops, one per direction, coupled
//! only through a shared cancellation token: when either direction aborts or
//! fails, the token fires and the peer loop resets its own side. Teardown is
//! idempotent.

use crate::relay::pump::pump;
use crate::relay::{Direction, ForwardingMode, FrameSink, FrameSource, Phase, RelayError};
use crate::util::{CallId, CancelToken};
use std::time::Duration;
use tracing::{debug, warn};

/// Terminal state of both directions of a finished relay pair.
#[derive(Debug)]
pub struct PairOutcome {
    pub client_to_backend: Result<Phase, RelayError>,
    pub backend_to_client: Result<Phase, RelayError>,
}

impl PairOutcome {
    /// Both directions ran to orderly completion.
    pub fn is_clean(&self) -> bool {
        matches!(self.client_to_backend, Ok(Phase::Closed))
            && matches!(self.backend_to_client, Ok(Phase::Closed))
    }
}

/// Handle for tearing down a running relay pair.
#[derive(Clone)]
pub struct RelayPairHandle {
    cancel: CancelToken,
}

impl RelayPairHandle {
    /// Abort the pair. Idempotent: repeat invocations have no further effect.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Whether the pair has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One client-stream/backend-stream binding.
pub struct RelayPair {
    mode: ForwardingMode,
    grace: Duration,
    call_id: CallId,
    cancel: CancelToken,
}

impl RelayPair {
    pub fn new(mode: ForwardingMode, grace: Duration, call_id: CallId) -> Self {
        Self {
            mode,
            grace,
            call_id,
            cancel: CancelToken::new(),
        }
    }

    /// Handle for aborting this pair from outside.
    pub fn handle(&self) -> RelayPairHandle {
        RelayPairHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Pump frames in both directions until both reach a terminal phase.
    pub async fn run<CS, BK, BS, CK>(
        self,
        client_source: CS,
        backend_sink: BK,
        backend_source: BS,
        client_sink: CK,
    ) -> PairOutcome
    where
        CS: FrameSource + 'static,
        BK: FrameSink + 'static,
        BS: FrameSource + 'static,
        CK: FrameSink + 'static,
    {
        // The forwarding discipline governs the response direction; request
        // frames always go out immediately so the backend sees the call as
        // soon as the client opens it.
        let upstream = tokio::spawn(run_direction(
            client_source,
            backend_sink,
            ForwardingMode::Immediate,
            self.cancel.clone(),
            Direction::ClientToBackend,
            self.grace,
            self.call_id.clone(),
        ));
        let downstream = tokio::spawn(run_direction(
            backend_source,
            client_sink,
            self.mode,
            self.cancel.clone(),
            Direction::BackendToClient,
            self.grace,
            self.call_id.clone(),
        ));

        let (upstream, downstream) = tokio::join!(upstream, downstream);

        PairOutcome {
            client_to_backend: flatten(upstream),
            backend_to_client: flatten(downstream),
        }
    }
}

async fn run_direction<S, K>(
    source: S,
    sink: K,
    mode: ForwardingMode,
    cancel: CancelToken,
    direction: Direction,
    grace: Duration,
    call_id: CallId,
) -> Result<Phase, RelayError>
where
    S: FrameSource,
    K: FrameSink,
{
    let result = pump(source, sink, mode, cancel.clone(), direction, grace).await;

    match &result {
        Ok(Phase::Aborted) => {
            cancel.cancel();
            debug!(call_id = %call_id, %direction, "relay direction aborted");
        }
        Ok(phase) => {
            debug!(call_id = %call_id, %direction, ?phase, "relay direction finished");
        }
        Err(err) => {
            cancel.cancel();
            warn!(call_id = %call_id, %direction, error = %err, "relay direction failed");
        }
    }

    result
}

fn flatten(
    joined: Result<Result<Phase, RelayError>, tokio::task::JoinError>,
) -> Result<Phase, RelayError> {
    joined.unwrap_or_else(|err| Err(RelayError::Transport(format!("relay task failed: {err}"))))
}
