//! Sink pools for user-facing engine output
//!
//! Container logs, build output and process stdout/stderr are broadcast to
//! whoever is listening (typically the CLI draining to the terminal). With
//! no subscribers the output is dropped silently, which is what a caller
//! that passed no writers asked for.

use tokio::sync::broadcast;

/// A pool of subscribers for one output stream
pub struct SinkPool {
    sender: broadcast::Sender<Vec<u8>>,
}

impl SinkPool {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to everything pushed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.sender.subscribe()
    }

    /// Push raw bytes to all subscribers; dropped when nobody listens.
    pub fn push(&self, data: Vec<u8>) {
        let _ = self.sender.send(data);
    }

    /// Push a line of text, appending the newline.
    pub fn push_line(&self, line: &str) {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.push(data);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SinkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SinkPool {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// The stdout/stderr pair every applicator writes through
#[derive(Clone, Default)]
pub struct OutputChannels {
    pub stdout: SinkPool,
    pub stderr: SinkPool,
}

impl OutputChannels {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_line_reaches_subscriber() {
        let pool = SinkPool::new();
        let mut rx = pool.subscribe();

        pool.push_line("[api] listening on 3000");

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, b"[api] listening on 3000\n");
    }

    #[tokio::test]
    async fn test_no_subscriber_drops_silently() {
        let pool = SinkPool::new();
        // Nothing to assert beyond "does not panic or block".
        pool.push(b"dropped".to_vec());
        assert_eq!(pool.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let channels = OutputChannels::new();
        let mut out = channels.stdout.subscribe();
        let mut err = channels.stderr.subscribe();

        channels.stdout.push_line("out");
        channels.stderr.push_line("err");

        assert_eq!(out.recv().await.unwrap(), b"out\n");
        assert_eq!(err.recv().await.unwrap(), b"err\n");
    }
}
