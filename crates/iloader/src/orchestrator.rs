//! Named multi-step operations.
//!
//! An operation is a list of titled steps run strictly in order on a Tokio
//! task. Observers poll [`OperationHandle::snapshot`] or follow
//! [`OperationHandle::subscribe`]. The first failing step halts the rest;
//! cancellation is honored between steps.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// Installs signed packages on a paired device.
///
/// Device discovery and pairing happen outside this crate.
#[async_trait]
pub trait DeviceInstaller: Send + Sync {
    /// Copy a signed IPA to the device.
    async fn upload(&self, ipa_path: &Path) -> Result<()>;

    /// Install the uploaded application.
    async fn install(&self, bundle_id: &str) -> Result<()>;
}

/// Flows offered by the installer screens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    InstallSideStore,
    InstallLiveContainer,
    CustomSideload,
    InstallCustomIpa,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::InstallSideStore => "install_sidestore",
            OperationKind::InstallLiveContainer => "install_livecontainer",
            OperationKind::CustomSideload => "custom_sideload",
            OperationKind::InstallCustomIpa => "install_custom_ipa",
        }
    }

    /// Step titles for this kind. `file_name` names the package for the
    /// custom IPA flow.
    pub fn step_titles(&self, file_name: &str) -> Vec<String> {
        match self {
            OperationKind::InstallCustomIpa => vec![
                "Verifying IPA Integrity".into(),
                "Unzipping Package".into(),
                format!("Signing {file_name}"),
                "Uploading to Device".into(),
                "Installing".into(),
            ],
            _ => vec![
                "Verifying Certificate".into(),
                "Signing Apps".into(),
                "Installing Apps".into(),
            ],
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepState {
    Pending,
    InProgress,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub title: String,
    pub state: StepState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Completed,
    /// `step` is the title of the step that failed
    Failed { step: String, reason: String },
    Cancelled,
}

impl OperationStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

/// Point-in-time view of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSnapshot {
    pub id: Uuid,
    pub kind: OperationKind,
    pub account: String,
    pub steps: Vec<Step>,
    pub status: OperationStatus,
}

pub type StepFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// One titled unit of work.
pub struct StepSpec {
    title: String,
    run: Box<dyn FnOnce() -> StepFuture + Send>,
}

impl StepSpec {
    pub fn new<F, Fut>(title: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            title: title.into(),
            run: Box::new(move || Box::pin(run())),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

/// Observes and controls a running operation.
#[derive(Clone)]
pub struct OperationHandle {
    id: Uuid,
    state: watch::Receiver<OperationSnapshot>,
    cancel: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle").field("id", &self.id).finish()
    }
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver that sees every step transition.
    pub fn subscribe(&self) -> watch::Receiver<OperationSnapshot> {
        self.state.clone()
    }

    /// Stop before the next step starts.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for the operation to finish and return its final state.
    pub async fn wait(&self) -> OperationSnapshot {
        let mut state = self.state.clone();
        loop {
            {
                let current = state.borrow_and_update();
                if current.status.is_finished() {
                    return current.clone();
                }
            }
            if state.changed().await.is_err() {
                return state.borrow().clone();
            }
        }
    }
}

/// Runs operations, one at a time per account.
#[derive(Default)]
pub struct OperationOrchestrator {
    active: Arc<Mutex<HashSet<String>>>,
}

impl OperationOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `account` has an operation running.
    pub fn is_busy(&self, account: &str) -> bool {
        self.active.lock().contains(account)
    }

    /// Start `steps` for `account` on the current Tokio runtime.
    ///
    /// Fails with [`Error::SessionInProgress`] while another operation for
    /// the same account is running.
    pub fn start(
        &self,
        kind: OperationKind,
        account: &str,
        steps: Vec<StepSpec>,
    ) -> Result<OperationHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("operations need a Tokio runtime".into()))?;
        if !self.active.lock().insert(account.to_string()) {
            warn!(account, %kind, "operation already running");
            return Err(Error::SessionInProgress);
        }

        let id = Uuid::new_v4();
        let snapshot = OperationSnapshot {
            id,
            kind,
            account: account.to_string(),
            steps: steps
                .iter()
                .map(|s| Step {
                    title: s.title.clone(),
                    state: StepState::Pending,
                })
                .collect(),
            status: OperationStatus::Running,
        };
        let (state_tx, state_rx) = watch::channel(snapshot);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        info!(%id, %kind, account, steps = steps.len(), "starting operation");

        let active = self.active.clone();
        let account = account.to_string();
        runtime.spawn(async move {
            let status = run_steps(&state_tx, &cancel_rx, steps).await;
            active.lock().remove(&account);
            info!(%id, ?status, "operation finished");
            state_tx.send_modify(|s| s.status = status);
        });

        Ok(OperationHandle {
            id,
            state: state_rx,
            cancel: Arc::new(cancel_tx),
        })
    }
}

async fn run_steps(
    state: &watch::Sender<OperationSnapshot>,
    cancel: &watch::Receiver<bool>,
    steps: Vec<StepSpec>,
) -> OperationStatus {
    for (index, step) in steps.into_iter().enumerate() {
        if *cancel.borrow() {
            return OperationStatus::Cancelled;
        }
        debug!(step = %step.title, "step started");
        state.send_modify(|s| s.steps[index].state = StepState::InProgress);

        match (step.run)().await {
            Ok(()) => state.send_modify(|s| s.steps[index].state = StepState::Completed),
            Err(e) => {
                let reason = e.user_message();
                warn!(step = %step.title, error = %e, "step failed");
                state.send_modify(|s| s.steps[index].state = StepState::Failed(reason.clone()));
                return OperationStatus::Failed {
                    step: step.title,
                    reason,
                };
            }
        }
    }
    OperationStatus::Completed
}
