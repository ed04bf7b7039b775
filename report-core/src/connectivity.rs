//! Online/offline signal supplied by the platform layer.
//!
//! The pipeline never probes the network itself; it only reads transitions
//! published through a [`ConnectivityHandle`].

use tokio::sync::watch;

pub fn connectivity_channel(initially_online: bool) -> (ConnectivityHandle, ConnectivityWatch) {
    let (tx, rx) = watch::channel(initially_online);
    (ConnectivityHandle { tx }, ConnectivityWatch { rx })
}

#[derive(Clone, Debug)]
pub struct ConnectivityHandle {
    tx: watch::Sender<bool>,
}

impl ConnectivityHandle {
    /// Publishes the current state. Repeating the current value is not a transition.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ConnectivityWatch {
        ConnectivityWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consumer side. Clones observe the same sequence independently.
#[derive(Clone, Debug)]
pub struct ConnectivityWatch {
    rx: watch::Receiver<bool>,
}

impl ConnectivityWatch {
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the next transition. `None` once the producer is gone.
    pub async fn next_change(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
