//! State-changed fan-out.
//!
//! Observers (the UI layer, in the full application) get a payload-free
//! "something changed" signal after every state transition and re-poll the
//! store themselves. Sending never fails from the core's point of view:
//! having no subscribers is normal.

use tokio::sync::broadcast;

#[derive(Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<()>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Fire-and-forget. A send error only means nobody is listening.
    pub fn notify(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
