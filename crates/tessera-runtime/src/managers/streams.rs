//! Stream lifecycle management for the Tessera runtime
//!
//! Streams borrowed while a session runs are parked here under the session id,
//! or under `UNKNOWN` when their message could not be attributed, and closed
//! together when the session is released.

use std::collections::HashMap;

use tessera_core::{StreamHandle, UNKNOWN_SESSION};
use tokio::sync::Mutex;
use tracing::{debug, warn};

// ----------------------------------------------------------------------------
// Stream Manager
// ----------------------------------------------------------------------------

/// Tracks session streams and closes each of them exactly once
#[derive(Debug, Default)]
pub struct StreamManager {
    streams: Mutex<HashMap<String, Vec<StreamHandle>>>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `stream` until `session_id` is released
    pub async fn add(&self, session_id: &str, stream: StreamHandle) {
        let mut streams = self.streams.lock().await;
        let bucket = streams.entry(session_id.to_string()).or_default();
        if bucket.iter().any(|existing| existing.same_stream(&stream)) {
            return;
        }
        bucket.push(stream);
    }

    /// Close every stream of `session_id` and of the `UNKNOWN` bucket
    ///
    /// Both buckets are taken out under one lock, so a concurrent release of the
    /// same session finds nothing left to close.
    pub async fn release(&self, session_id: &str) {
        let released: Vec<StreamHandle> = {
            let mut streams = self.streams.lock().await;
            let mut taken = streams.remove(session_id).unwrap_or_default();
            if session_id != UNKNOWN_SESSION {
                taken.extend(streams.remove(UNKNOWN_SESSION).unwrap_or_default());
            }
            taken
        };

        if released.is_empty() {
            return;
        }
        debug!(session = session_id, count = released.len(), "Releasing streams");

        for stream in released {
            stream.release_all();
            if let Err(e) = stream.close().await {
                warn!(session = session_id, peer = %stream.remote_peer(), error = %e, "Failed to close stream");
            }
        }
    }

    /// Close one stream now instead of waiting for its session to be released
    ///
    /// Used when the session is unknown locally, either not started yet or
    /// already released, so no later release would sweep the stream.
    pub async fn discard(&self, session_id: &str, stream: &StreamHandle) {
        {
            let mut streams = self.streams.lock().await;
            if let Some(bucket) = streams.get_mut(session_id) {
                bucket.retain(|existing| !existing.same_stream(stream));
                if bucket.is_empty() {
                    streams.remove(session_id);
                }
            }
        }
        stream.release_all();
        if let Err(e) = stream.close().await {
            debug!(session = session_id, peer = %stream.remote_peer(), error = %e, "Failed to close stream");
        }
    }

    /// Number of streams parked under `session_id`
    pub async fn pending(&self, session_id: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Total number of parked streams
    pub async fn len(&self) -> usize {
        self.streams.lock().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
