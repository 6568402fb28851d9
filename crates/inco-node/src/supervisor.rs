use anyhow::{Context, Result};
use inco_mesh::receiver::Listener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the background listener task.
pub struct ListenerSupervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerSupervisor {
    /// Run the listener's setup on the current task, then spawn its run loop.
    pub async fn start<L: Listener>(mut listener: L) -> Result<Self> {
        listener
            .setup()
            .await
            .context("failed to set up listener")?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(listener, cancel.clone()));
        Ok(Self { cancel, task })
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Request a cooperative stop. Returns at once; use
    /// [`ListenerShutdown::await_termination`] to wait for the task to exit.
    pub fn stop(self) -> ListenerShutdown {
        self.cancel.cancel();
        ListenerShutdown { task: self.task }
    }
}

async fn supervise<L: Listener>(listener: L, cancel: CancellationToken) {
    match listener.run(cancel).await {
        Ok(()) => tracing::debug!("listener exited"),
        Err(e) => tracing::warn!(err = %e, "listener failed"),
    }
}

/// A listener that has been asked to stop.
pub struct ListenerShutdown {
    task: JoinHandle<()>,
}

impl ListenerShutdown {
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait until the listener task has exited. There is no timeout: a
    /// listener that ignores cancellation blocks this forever.
    pub async fn await_termination(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(err = %e, "listener task aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeListener;
    use std::time::Duration;

    #[tokio::test]
    async fn setup_failure_is_returned() {
        let (listener, watch) = FakeListener::failing_setup();
        let err = ListenerSupervisor::start(listener).await.err().unwrap();
        assert!(err.to_string().contains("failed to set up listener"));
        assert!(!watch.is_alive());
    }

    #[tokio::test]
    async fn listener_runs_until_stopped() {
        let (listener, watch) = FakeListener::new();
        let supervisor = ListenerSupervisor::start(listener).await.unwrap();
        assert!(watch.was_set_up());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(supervisor.is_alive());
        assert!(watch.is_alive());

        supervisor.stop().await_termination().await;
        assert!(!watch.is_alive());
    }

    #[tokio::test]
    async fn termination_waits_for_a_lingering_listener() {
        let (listener, watch) = FakeListener::with_linger(Duration::from_millis(150));
        let supervisor = ListenerSupervisor::start(listener).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let shutdown = supervisor.stop();
        // Still winding down right after the stop request.
        assert!(shutdown.is_alive());
        assert!(watch.is_alive());

        shutdown.await_termination().await;
        assert!(!watch.is_alive());
    }

    #[tokio::test]
    async fn failed_run_still_terminates() {
        let (listener, watch) = FakeListener::failing_run();
        let supervisor = ListenerSupervisor::start(listener).await.unwrap();
        supervisor.stop().await_termination().await;
        assert!(!watch.is_alive());
    }
}
