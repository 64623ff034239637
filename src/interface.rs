//! Threaded interface for submitting and controlling matrix requests.
//!
//! A minimal thread-per-request runner: it accepts [`MatrixRequest`]s,
//! executes them on a background thread against a shared dataset, and sends
//! the result back over a channel. Cancellation is cooperative via an
//! `Arc<AtomicBool>` checked by the orchestrator between per-term queries;
//! an aborted request yields `Cancelled` and never a partial matrix.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{PhenoqueryError, Result};
use crate::matrix::{self, MatrixRequest, MatrixResponse};
use crate::store::Dataset;

/// Cancellation token shared with the worker thread.
#[derive(Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CancelToken {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// Opaque request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// Handle to a running or completed matrix request.
pub struct RequestHandle {
    pub id: RequestId,
    cancel: CancelToken,
    started: Instant,
    join: Option<JoinHandle<()>>,
    pub result: Receiver<Result<MatrixResponse>>,
}

impl RequestHandle {
    /// Request cancellation (cooperative). The worker may take a short time
    /// to observe it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    /// Wait for the request to finish.
    pub fn join(mut self) -> Option<Result<MatrixResponse>> {
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.result.try_recv().ok()
    }
    /// Elapsed time since submission.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Registry managing matrix request lifecycles over a shared dataset.
pub struct MatrixRunner {
    dataset: Arc<Mutex<Dataset>>,
    next_id: Mutex<u64>,
    // shared with worker threads, which drop their own entry on completion
    active: Arc<Mutex<HashMap<RequestId, CancelToken>>>,
}

impl MatrixRunner {
    pub fn new(dataset: Arc<Mutex<Dataset>>) -> Self {
        Self {
            dataset,
            next_id: Mutex::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn allocate_id(&self) -> Result<RequestId> {
        let mut next = self
            .next_id
            .lock()
            .map_err(|e| PhenoqueryError::Lock(e.to_string()))?;
        *next += 1;
        Ok(RequestId(*next))
    }

    /// Submit a request for execution on a background thread.
    pub fn start(&self, request: MatrixRequest) -> Result<RequestHandle> {
        let id = self.allocate_id()?;
        let cancel = CancelToken::new();
        self.active
            .lock()
            .map_err(|e| PhenoqueryError::Lock(e.to_string()))?
            .insert(id, cancel.clone());

        let (tx, rx) = mpsc::channel();
        let dataset = Arc::clone(&self.dataset);
        let active = Arc::clone(&self.active);
        let cancel_for_thread = cancel.clone();
        let join = std::thread::spawn(move || {
            let outcome = match dataset.lock() {
                Ok(dataset) => matrix::get_matrix(&dataset, &request, Some(&cancel_for_thread)),
                Err(e) => Err(PhenoqueryError::Lock(e.to_string())),
            };
            debug!(ok = outcome.is_ok(), "matrix request finished");
            if let Ok(mut active) = active.lock() {
                active.remove(&id);
            }
            let _ = tx.send(outcome);
        });

        Ok(RequestHandle {
            id,
            cancel,
            started: Instant::now(),
            join: Some(join),
            result: rx,
        })
    }

    /// Run a request synchronously on the current thread.
    pub fn run_sync(&self, request: &MatrixRequest) -> Result<MatrixResponse> {
        let dataset = self
            .dataset
            .lock()
            .map_err(|e| PhenoqueryError::Lock(e.to_string()))?;
        matrix::get_matrix(&dataset, request, None)
    }

    /// Cancel a request by id.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.active.lock() {
            Ok(active) => {
                if let Some(token) = active.get(&id) {
                    token.cancel();
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        }
    }
}
