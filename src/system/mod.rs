//! Shared runtime plumbing: output sinks and progress reporting

mod sink;

pub use sink::{OutputChannels, SinkPool};

use std::sync::Arc;

/// Optional sub-status callback threaded through every applicator.
///
/// Cloning is cheap; an unset callback swallows messages.
#[derive(Clone, Default)]
pub struct Progress(Option<Arc<dyn Fn(&str) + Send + Sync>>);

impl Progress {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self(Some(Arc::new(callback)))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn emit(&self, message: &str) {
        if let Some(callback) = &self.0 {
            callback(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_progress_emit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = Progress::new(move |msg| sink.lock().unwrap().push(msg.to_string()));

        progress.emit("pulling image 50% (2/4 layers)");
        Progress::none().emit("dropped");

        assert_eq!(seen.lock().unwrap().as_slice(), ["pulling image 50% (2/4 layers)"]);
    }
}
