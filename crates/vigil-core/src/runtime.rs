//! Process-wide ML runtime selection.
//!
//! The runtime is chosen once per process by walking a list of candidate
//! execution backends in preference order. Initialization is memoized in a
//! [`RuntimeCell`] with an explicit lifecycle so concurrent callers share a
//! single in-flight attempt, and a failed attempt can be retried later.

use crate::detector::DetectorError;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
    OpenVINOExecutionProvider,
};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// A candidate execution backend for the ML runtime.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Check that the backend can run on this host.
    fn initialize(&self) -> Result<(), DetectorError>;

    /// Execution provider to register on model sessions, if any.
    fn dispatch(&self) -> Option<ExecutionProviderDispatch> {
        None
    }
}

/// ONNX Runtime execution providers, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtBackend {
    Cuda,
    OpenVino,
    Cpu,
}

impl OrtBackend {
    pub const PREFERENCE: [OrtBackend; 3] = [OrtBackend::Cuda, OrtBackend::OpenVino, OrtBackend::Cpu];

    /// The default candidate list handed to [`RuntimeCell::get_or_init`].
    pub fn candidates() -> Vec<Arc<dyn ExecutionBackend>> {
        Self::PREFERENCE
            .iter()
            .map(|&b| Arc::new(b) as Arc<dyn ExecutionBackend>)
            .collect()
    }
}

impl ExecutionBackend for OrtBackend {
    fn name(&self) -> &str {
        match self {
            OrtBackend::Cuda => "cuda",
            OrtBackend::OpenVino => "openvino",
            OrtBackend::Cpu => "cpu",
        }
    }

    fn initialize(&self) -> Result<(), DetectorError> {
        let available = match self {
            OrtBackend::Cuda => CUDAExecutionProvider::default().is_available()?,
            OrtBackend::OpenVino => OpenVINOExecutionProvider::default().is_available()?,
            OrtBackend::Cpu => CPUExecutionProvider::default().is_available()?,
        };
        if available {
            Ok(())
        } else {
            Err(DetectorError::BackendUnavailable(self.name().to_string()))
        }
    }

    fn dispatch(&self) -> Option<ExecutionProviderDispatch> {
        let ep = match self {
            OrtBackend::Cuda => CUDAExecutionProvider::default().build(),
            OrtBackend::OpenVino => OpenVINOExecutionProvider::default().build(),
            // Plain sessions already run on CPU.
            OrtBackend::Cpu => return None,
        };
        Some(ep.error_on_failure())
    }
}

/// Handle to an initialized ML runtime.
pub struct MlRuntime {
    backend: Arc<dyn ExecutionBackend>,
}

impl MlRuntime {
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Execution providers for the accelerated model path.
    pub fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        self.backend.dispatch().into_iter().collect()
    }
}

impl std::fmt::Debug for MlRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlRuntime")
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Observable lifecycle of a [`RuntimeCell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Uninitialized,
    Initializing,
    Ready { backend: String },
    Failed { reason: String },
}

enum RuntimeState {
    Uninitialized,
    /// `attempt` increments every time an initialization starts, so waiters can
    /// tell which attempt's outcome they are looking at.
    Initializing { attempt: u64 },
    Ready(Arc<MlRuntime>),
    Failed { attempt: u64, reason: String },
}

/// Memoized, lazily-initialized ML runtime.
pub struct RuntimeCell {
    state: Mutex<RuntimeState>,
    settled: Condvar,
    attempts: Mutex<u64>,
}

static SHARED_RUNTIME: OnceLock<RuntimeCell> = OnceLock::new();

/// The process-wide runtime cell.
pub fn shared_runtime() -> &'static RuntimeCell {
    SHARED_RUNTIME.get_or_init(RuntimeCell::new)
}

impl Default for RuntimeCell {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RuntimeState::Uninitialized),
            settled: Condvar::new(),
            attempts: Mutex::new(0),
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        match &*self.lock_state() {
            RuntimeState::Uninitialized => RuntimeStatus::Uninitialized,
            RuntimeState::Initializing { .. } => RuntimeStatus::Initializing,
            RuntimeState::Ready(rt) => RuntimeStatus::Ready {
                backend: rt.backend_name().to_string(),
            },
            RuntimeState::Failed { reason, .. } => RuntimeStatus::Failed {
                reason: reason.clone(),
            },
        }
    }

    /// Number of initialization attempts started so far.
    pub fn attempts(&self) -> u64 {
        *self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the ready runtime, initializing it from `candidates` if needed.
    ///
    /// Blocks while another caller's initialization is in flight and shares its
    /// outcome. A `Failed` state left by an earlier attempt is retried.
    pub fn get_or_init(
        &self,
        candidates: &[Arc<dyn ExecutionBackend>],
    ) -> Result<Arc<MlRuntime>, DetectorError> {
        let mut state = self.lock_state();
        let attempt = loop {
            match &*state {
                RuntimeState::Ready(rt) => return Ok(Arc::clone(rt)),
                RuntimeState::Initializing { attempt } => {
                    let awaited = *attempt;
                    state = self
                        .settled
                        .wait_while(state, |s| {
                            matches!(s, RuntimeState::Initializing { attempt } if *attempt == awaited)
                        })
                        .unwrap_or_else(|e| e.into_inner());
                    if let RuntimeState::Failed { attempt, reason } = &*state {
                        if *attempt == awaited {
                            return Err(DetectorError::RuntimeUnavailable(reason.clone()));
                        }
                    }
                }
                RuntimeState::Uninitialized | RuntimeState::Failed { .. } => {
                    let attempt = {
                        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
                        *attempts += 1;
                        *attempts
                    };
                    *state = RuntimeState::Initializing { attempt };
                    break attempt;
                }
            }
        };
        drop(state);

        let outcome = select_backend(candidates);

        let mut state = self.lock_state();
        let result = match outcome {
            Ok(backend) => {
                let rt = Arc::new(MlRuntime { backend });
                tracing::info!(backend = rt.backend_name(), attempt, "ML runtime ready");
                *state = RuntimeState::Ready(Arc::clone(&rt));
                Ok(rt)
            }
            Err(reason) => {
                tracing::warn!(attempt, reason = %reason, "ML runtime initialization failed");
                *state = RuntimeState::Failed {
                    attempt,
                    reason: reason.clone(),
                };
                Err(DetectorError::RuntimeUnavailable(reason))
            }
        };
        drop(state);
        self.settled.notify_all();
        result
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Try each backend in order; the first that initializes wins.
fn select_backend(
    candidates: &[Arc<dyn ExecutionBackend>],
) -> Result<Arc<dyn ExecutionBackend>, String> {
    let mut failures = Vec::new();
    for backend in candidates {
        match backend.initialize() {
            Ok(()) => return Ok(Arc::clone(backend)),
            Err(e) => {
                tracing::debug!(backend = backend.name(), phase = "runtime-init", error = %e, "execution backend rejected");
                failures.push(format!("{}: {e}", backend.name()));
            }
        }
    }
    if failures.is_empty() {
        Err("no execution backends configured".to_string())
    } else {
        Err(failures.join("; "))
    }
}
