use std::sync::Arc;
use tokio::sync::watch;

/// Fires the shared cancellation signal.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Cloneable cancellation signal observed by every long-running task.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once triggered. A dropped trigger never fires.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// A signal that fires when this one does, or when the returned trigger is used.
    pub fn child(&self) -> (ShutdownTrigger, Shutdown) {
        let (trigger, child) = channel();
        let parent = self.clone();
        let forward = trigger.clone();
        let observed = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => forward.trigger(),
                _ = observed.cancelled() => {}
            }
        });
        (trigger, child)
    }
}
