//! Child process supervision with graceful stop.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::engine::ProcessExit;

/// Spawn a task that waits for `child` to exit and reports it.
///
/// When `cancellation_token` fires, `q` is written to the child's stdin (the
/// transcoder's quit command) and the child gets `grace` to exit before it is
/// killed. The reported [`ProcessExit`] is marked `requested` in that case.
pub fn spawn_process_waiter(
    mut child: Child,
    cancellation_token: CancellationToken,
    grace: Duration,
) -> oneshot::Receiver<ProcessExit> {
    let (tx, rx) = oneshot::channel();
    let stdin = child.stdin.take();

    tokio::spawn(async move {
        let exit = tokio::select! {
            _ = cancellation_token.cancelled() => {
                stop_child(&mut child, stdin, grace).await
            }
            status = child.wait() => match status {
                Ok(status) => {
                    let description = process_utils::describe_exit(&status);
                    if !status.success() {
                        warn!(pid = ?child.id(), "Process exited: {}", description);
                    }
                    ProcessExit {
                        code: status.code(),
                        description,
                        requested: false,
                    }
                }
                Err(e) => {
                    error!("Error waiting for process: {}", e);
                    ProcessExit {
                        code: None,
                        description: format!("wait failed: {e}"),
                        requested: false,
                    }
                }
            },
        };
        let _ = tx.send(exit);
    });

    rx
}

async fn stop_child(child: &mut Child, stdin: Option<ChildStdin>, grace: Duration) -> ProcessExit {
    if let Some(mut stdin) = stdin {
        if let Err(e) = stdin.write_all(b"q").await {
            debug!("Failed to send quit to process: {}", e);
        }
        drop(stdin);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            let mut exit = ProcessExit::requested(process_utils::describe_exit(&status));
            exit.code = status.code();
            exit
        }
        Ok(Err(e)) => ProcessExit::requested(format!("wait failed: {e}")),
        Err(_) => {
            warn!(pid = ?child.id(), "Process ignored quit request, killing");
            if let Err(e) = child.kill().await {
                error!("Failed to kill process: {}", e);
            }
            ProcessExit::requested("killed after grace period")
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn test_reports_natural_exit() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let exit = spawn_process_waiter(child, CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.requested);
        assert_eq!(exit.description, "exit code 3");
    }

    #[tokio::test]
    async fn test_kills_process_ignoring_quit() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();
        let cancel = CancellationToken::new();
        let rx = spawn_process_waiter(child, cancel.clone(), Duration::from_millis(100));
        cancel.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(exit.requested);
    }
}
