use std::sync::Arc;

use tokio::sync::watch;

use crate::core::config::Settings;
use crate::domain::models::RubricLimits;
use crate::services::normalizer::NormalizerLimits;
use crate::services::workspace::WorkspaceManager;
use crate::tasks::grading::GradingOrchestrator;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    workspace: Arc<WorkspaceManager>,
    orchestrator: Arc<GradingOrchestrator>,
    normalizer_limits: NormalizerLimits,
    rubric_limits: RubricLimits,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        workspace: Arc<WorkspaceManager>,
        orchestrator: Arc<GradingOrchestrator>,
    ) -> Self {
        let normalizer_limits = NormalizerLimits::from_settings(&settings);
        let rubric_limits = RubricLimits::from_settings(&settings);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(InnerState {
                settings,
                workspace,
                orchestrator,
                normalizer_limits,
                rubric_limits,
                shutdown,
            }),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn workspace(&self) -> &Arc<WorkspaceManager> {
        &self.inner.workspace
    }

    pub(crate) fn orchestrator(&self) -> &Arc<GradingOrchestrator> {
        &self.inner.orchestrator
    }

    pub(crate) fn normalizer_limits(&self) -> &NormalizerLimits {
        &self.inner.normalizer_limits
    }

    pub(crate) fn rubric_limits(&self) -> &RubricLimits {
        &self.inner.rubric_limits
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Flags shutdown to running batches and background loops.
    pub(crate) fn begin_shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }
}
