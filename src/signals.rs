use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

/// Signal handling for daemon shutdown.
///
/// SIGTERM and SIGINT set a shared flag. The supervision loop polls it between
/// cycles, so shutdown takes effect at the next interval boundary.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// A flag with no OS handlers attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install SIGTERM/SIGINT listeners. Must be called inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        let shutdown = Self::new();
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let flag = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = term.recv() => tracing::info!("received SIGTERM, stopping after this cycle"),
                _ = int.recv() => tracing::info!("received SIGINT, stopping after this cycle"),
            }
            flag.request();
        });
        Ok(shutdown)
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_shared_between_clones() {
        let a = ShutdownSignal::new();
        let b = a.clone();
        assert!(!b.is_requested());
        a.request();
        assert!(b.is_requested());
    }

    #[tokio::test]
    async fn test_install_inside_runtime() {
        let shutdown = ShutdownSignal::install().unwrap();
        assert!(!shutdown.is_requested());
    }
}
