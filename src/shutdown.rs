use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::IngestError;

#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            let _ = tokio::signal::ctrl_c().await;
            info!("received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received SIGINT");
}

pub fn install(runtime: &Runtime) -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    runtime.spawn(async move {
        wait_for_signal().await;
        signalled.cancel();
    });
    token
}

pub fn check(token: &CancellationToken) -> Result<(), IngestError> {
    if token.is_cancelled() {
        return Err(IngestError::Interrupted);
    }
    Ok(())
}

pub fn sleep(token: &CancellationToken, duration: Duration) -> bool {
    let step = Duration::from_millis(200);
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(step.min(deadline - now));
    }
}
