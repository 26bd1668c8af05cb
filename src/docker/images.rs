//! Image inspection and pulling

use std::collections::HashMap;

use bollard::image::CreateImageOptions;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::system::Progress;

use super::{is_not_found, DockerError, DockerResult, DockerService};

impl DockerService {
    /// Make sure `image` is available locally, pulling it on a miss.
    pub async fn ensure_image(
        &self,
        image: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> DockerResult<()> {
        match self.client().inspect_image(image).await {
            Ok(_) => {
                debug!("Image {} already present", image);
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {
                info!("Image {} not found locally, pulling", image);
            }
            Err(e) => return Err(DockerError::Docker(e)),
        }

        self.pull_with_progress(image, progress, cancel).await
    }

    /// Pull an image, reporting aggregate layer progress.
    pub async fn pull_with_progress(
        &self,
        image: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> DockerResult<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client().create_image(Some(options), None, None);

        // Layer id -> (current, total) byte counts; completed layers tracked
        // separately because their progress detail disappears.
        let mut layers: HashMap<String, (u64, u64)> = HashMap::new();
        let mut completed: HashMap<String, bool> = HashMap::new();
        let mut last_percent: i64 = -1;

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = cancel.cancelled() => return Err(DockerError::Cancelled),
            };

            let info = match item {
                Some(Ok(info)) => info,
                Some(Err(e)) => return Err(DockerError::ImagePull(e.to_string())),
                None => break,
            };

            let Some(layer) = info.id.clone() else {
                continue;
            };

            if let Some(detail) = &info.progress_detail {
                let current = detail.current.unwrap_or(0).max(0) as u64;
                let total = detail.total.unwrap_or(0).max(0) as u64;
                if total > 0 {
                    layers.insert(layer.clone(), (current, total));
                }
            }

            if let Some(status) = &info.status {
                match status.as_str() {
                    "Pull complete" | "Already exists" => {
                        completed.insert(layer.clone(), true);
                        if let Some(entry) = layers.get_mut(&layer) {
                            entry.0 = entry.1;
                        }
                    }
                    _ => {
                        completed.entry(layer.clone()).or_insert(false);
                    }
                }
            }

            let total_layers = completed.len();
            let done_layers = completed.values().filter(|done| **done).count();
            let (current_bytes, total_bytes) = layers
                .values()
                .fold((0u64, 0u64), |acc, (c, t)| (acc.0 + c, acc.1 + t));

            if total_bytes > 0 && total_layers > 0 {
                let percent = ((current_bytes as f64 / total_bytes as f64) * 100.0) as i64;
                if percent != last_percent {
                    last_percent = percent;
                    progress.emit(&format!(
                        "pulling {}: {}% ({}/{} layers)",
                        image, percent, done_layers, total_layers
                    ));
                }
            }
        }

        info!("Pulled image {}", image);
        Ok(())
    }

    /// Resolve an image reference (tag or id) to its image id.
    pub async fn resolve_image_id(&self, reference: &str) -> DockerResult<Option<String>> {
        match self.client().inspect_image(reference).await {
            Ok(inspect) => Ok(inspect.id),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(DockerError::Docker(e)),
        }
    }

    /// Best-effort, non-forced image removal.
    pub async fn remove_image(&self, reference: &str) -> DockerResult<()> {
        match self.client().remove_image(reference, None, None).await {
            Ok(_) => {
                debug!("Removed image {}", reference);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(DockerError::Docker(e)),
        }
    }
}
