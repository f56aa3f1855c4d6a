use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Derives "show the disconnected banner" from connectivity. The banner
/// only appears once the link has been down for `delay`, so quick
/// reconnects never flash it.
pub struct DisconnectBanner {
    visible: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl DisconnectBanner {
    pub fn spawn(mut status: watch::Receiver<bool>, delay: Duration) -> Self {
        let (visible_tx, visible) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                let connected = *status.borrow_and_update();
                if connected {
                    set(&visible_tx, false);
                    if status.changed().await.is_err() {
                        return;
                    }
                    continue;
                }

                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        set(&visible_tx, true);
                        if status.changed().await.is_err() {
                            return;
                        }
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        DisconnectBanner { visible, task }
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.visible.clone()
    }
}

impl Drop for DisconnectBanner {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn set(visible: &watch::Sender<bool>, show: bool) {
    visible.send_if_modified(|current| {
        if *current == show {
            return false;
        }
        if show {
            warn!("Realtime connection lost, showing banner");
        } else {
            info!("Realtime connection back, hiding banner");
        }
        *current = show;
        true
    });
}
