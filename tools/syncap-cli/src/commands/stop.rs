//! Stop a running recorder through its pid file.

use std::path::PathBuf;
use std::time::Duration;

use syncap_capture_engine::pid::{process_alive, read_pid, send_interrupt};
use syncap_common::config::RecorderConfig;
use tokio::time::Instant;

/// Slack on top of the drain timeout for the recorder to write its manifest.
const CLOSE_SLACK: Duration = Duration::from_secs(5);

pub async fn run(
    config: &RecorderConfig,
    pid_file: Option<PathBuf>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let path = pid_file.unwrap_or_else(|| config.session.pid_file_path());
    let Some(pid) = read_pid(&path)? else {
        println!("No recorder running (no pid file at {}).", path.display());
        return Ok(());
    };

    if !process_alive(pid) {
        std::fs::remove_file(&path)?;
        println!("Removed stale pid file {} (pid {pid} is gone).", path.display());
        return Ok(());
    }

    send_interrupt(pid)?;
    println!("Sent interrupt to recorder (pid {pid}); waiting for it to close...");

    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.session.drain_timeout() + CLOSE_SLACK);
    let deadline = Instant::now() + timeout;

    loop {
        if !path.exists() {
            println!("Recorder closed.");
            return Ok(());
        }
        if !process_alive(pid) {
            // Exited without cleaning up after itself.
            let _ = std::fs::remove_file(&path);
            println!("Recorder exited; removed its pid file.");
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "Recorder (pid {pid}) did not close within {}s",
                timeout.as_secs()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
