//! Shutdown signalling for long-running pollers.

use tokio::sync::watch;

/// Fires the shutdown signal. Dropping it without firing also shuts everything down.
#[derive(Debug)]
pub struct Trigger(watch::Sender<bool>);

impl Trigger {
    pub fn fire(&self) {
        self.0.send_replace(true);
    }
}

/// Listens for the shutdown signal.
///
/// Once the signal has been seen it is remembered, so [`Shutdown::recv`] returns immediately on every later call.
#[derive(Clone, Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received
    shutdown: bool,
    notify: watch::Receiver<bool>,
}

pub fn channel() -> (Trigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (
        Trigger(tx),
        Shutdown {
            shutdown: false,
            notify: rx,
        },
    )
}

impl Shutdown {
    /// Returns `true` if the shutdown signal has been received.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown || *self.notify.borrow()
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        while !self.shutdown {
            if *self.notify.borrow_and_update() {
                break;
            }
            // A dropped trigger can never fire, treat it as a shutdown.
            if self.notify.changed().await.is_err() {
                break;
            }
        }
        self.shutdown = true;
    }
}

#[tokio::test]
async fn recv_returns_once_fired() {
    let (trigger, mut shutdown) = channel();
    let mut other = shutdown.clone();
    assert!(!shutdown.is_shutdown());

    trigger.fire();
    shutdown.recv().await;
    other.recv().await;

    assert!(shutdown.is_shutdown());
    assert!(other.is_shutdown());
    shutdown.recv().await;
}

#[tokio::test]
async fn dropped_trigger_shuts_down() {
    let (trigger, mut shutdown) = channel();
    drop(trigger);
    shutdown.recv().await;
    assert!(shutdown.is_shutdown());
}
