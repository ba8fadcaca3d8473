//! Completion signals shared by the two branches of a signing race

use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the completion channel; each branch signals at most once
const RACE_CHANNEL_CAPACITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceSignal {
    /// A valid signature produced elsewhere arrived
    SignatureReceived,
    /// The local branch reached a terminal state
    SignatureGenerated,
}

/// Buffered completion channel of one race
#[derive(Debug, Clone)]
pub struct RaceChannel {
    tx: broadcast::Sender<RaceSignal>,
}

impl Default for RaceChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RaceChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(RACE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn signal(&self, signal: RaceSignal) {
        trace!(?signal, "Race signal");
        // Nobody listening means the other branch already returned
        let _ = self.tx.send(signal);
    }

    /// Listener resolving on `signal`
    ///
    /// Listeners only observe signals sent after they were created, so they
    /// must be created before either branch starts.
    pub fn listen_for(&self, signal: RaceSignal) -> RaceListener {
        RaceListener {
            rx: Some(self.tx.subscribe()),
            target: signal,
        }
    }
}

/// One branch's view of the race
#[derive(Debug)]
pub struct RaceListener {
    rx: Option<broadcast::Receiver<RaceSignal>>,
    target: RaceSignal,
}

impl RaceListener {
    /// Listener that never fires, for callers outside a race
    pub fn detached() -> Self {
        Self {
            rx: None,
            target: RaceSignal::SignatureReceived,
        }
    }

    /// Resolve once the target signal arrives; pends forever otherwise
    pub async fn cancelled(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            match rx.recv().await {
                Ok(signal) if signal == self.target => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
            }
        }
    }
}
