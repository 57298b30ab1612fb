use std::time::Duration;

use anyhow::{anyhow, Result};
use gatekeeper_core::tokio::{self, task::JoinHandle};

/// how long a freshly spawned task must stay up to count as started
const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// fails if the server task exits (cleanly or not) right after being spawned,
/// e.g. because a socket could not be bound
pub(crate) async fn verify_server_task_running(
    name: &str,
    task: &mut JoinHandle<Result<()>>,
) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(Ok(Ok(()))) => Err(anyhow!("{name} exited during startup stabilization window")),
        Ok(Ok(Err(err))) => Err(err.context(format!("{name} failed during startup"))),
        Ok(Err(err)) => Err(anyhow!("{name} panicked during startup: {err}")),
    }
}

pub(crate) async fn verify_background_task_running(
    name: &str,
    task: &mut JoinHandle<()>,
) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(Ok(())) => Err(anyhow!("{name} exited during startup stabilization window")),
        Ok(Err(err)) => Err(anyhow!("{name} panicked during startup: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_server_task_detected() {
        let mut task = tokio::spawn(async { Err(anyhow!("address in use")) });
        let err = verify_server_task_running("dhcpv4 server", &mut task)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("address in use"));
    }

    #[tokio::test]
    async fn test_running_task_passes() {
        let mut task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        assert!(verify_background_task_running("logger", &mut task)
            .await
            .is_ok());
        task.abort();

        let mut done = tokio::spawn(async {});
        assert!(verify_background_task_running("logger", &mut done)
            .await
            .is_err());
    }
}
