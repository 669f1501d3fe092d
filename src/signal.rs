use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Control messages driving the application lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalTo {
    /// Reload configuration from the filesystem.
    ReloadFromDisk,
    /// Shut down gracefully.
    Shutdown,
    /// Shut down immediately.
    Quit,
}

pub type SignalRx = mpsc::Receiver<SignalTo>;

/// Spawn the OS signal listener. SIGHUP reloads, SIGINT and SIGTERM
/// shut down gracefully, a second SIGINT quits immediately.
pub fn os_signals() -> crate::Result<SignalRx> {
    let (tx, rx) = mpsc::channel(2);

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        let mut interrupted = false;

        loop {
            let to = tokio::select! {
                _ = sighup.recv() => SignalTo::ReloadFromDisk,
                _ = sigint.recv() => {
                    if interrupted {
                        SignalTo::Quit
                    } else {
                        interrupted = true;
                        SignalTo::Shutdown
                    }
                }
                _ = sigterm.recv() => SignalTo::Shutdown,
            };

            if tx.send(to).await.is_err() {
                error!(message = "couldn't send signal");
                return;
            }
        }
    });

    Ok(rx)
}
