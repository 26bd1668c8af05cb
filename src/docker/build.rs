//! Image builds: context archiving and build-stream handling

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bollard::image::{BuildImageOptions, TagImageOptions};
use futures_util::StreamExt;
use ignore::WalkBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::system::{OutputChannels, Progress};

use super::stream::short_id;
use super::{DockerError, DockerResult, DockerService};

/// Paths excluded from every build context, `.dockerignore` or not
const BASELINE_EXCLUSIONS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    ".DS_Store",
    "__pycache__",
    ".venv",
];

/// Inputs to one image build
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub context: PathBuf,

    /// Dockerfile path; absolute paths are rebased relative to the context.
    pub dockerfile: Option<String>,

    pub tags: Vec<String>,

    pub args: BTreeMap<String, String>,

    pub target: Option<String>,

    pub no_cache: bool,

    pub timeout: Duration,

    /// Echo the full build stream instead of progress summaries.
    pub verbose: bool,
}

/// A completed build
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub image_id: String,
    pub tags: Vec<String>,
    pub size: i64,
}

/// Dockerfile path as the daemon wants it: relative to the context root.
fn rebase_dockerfile(context: &Path, dockerfile: &str) -> String {
    let path = Path::new(dockerfile);
    if path.is_absolute() {
        match path.strip_prefix(context) {
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "Dockerfile".to_string()),
        }
    } else {
        dockerfile.to_string()
    }
}

/// Tar the build context, honoring `.dockerignore` plus the baseline list.
fn tar_context(context: &Path) -> DockerResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let walk = WalkBuilder::new(context)
        .standard_filters(false)
        .hidden(false)
        .add_custom_ignore_filename(".dockerignore")
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| !BASELINE_EXCLUSIONS.contains(&name))
                .unwrap_or(true)
        })
        .build();

    for entry in walk {
        let entry = entry.map_err(|e| DockerError::Build(e.to_string()))?;
        let path = entry.path();
        let rel = match path.strip_prefix(context) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        builder.append_path_with_name(path, rel)?;
    }

    let data = builder.into_inner()?;
    Ok(data)
}

fn parse_built_id(line: &str) -> Option<String> {
    line.trim()
        .strip_prefix("Successfully built ")
        .map(|id| id.trim().to_string())
}

/// Split an image tag reference into (repo, tag) for the tag endpoint.
fn split_tag(reference: &str) -> (&str, &str) {
    match reference.rfind(':') {
        Some(idx) if idx > reference.rfind('/').unwrap_or(0) => {
            (&reference[..idx], &reference[idx + 1..])
        }
        _ => (reference, "latest"),
    }
}

impl DockerService {
    /// Build an image from a local context, streaming build output.
    pub async fn build_image(
        &self,
        opts: &BuildOptions,
        sinks: &OutputChannels,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> DockerResult<BuildOutcome> {
        let primary_tag = opts.tags.first().cloned().unwrap_or_default();
        progress.emit(&format!("building image {}", primary_tag));

        let context = opts.context.clone();
        let tarball = tokio::task::spawn_blocking(move || tar_context(&context))
            .await
            .map_err(|e| DockerError::Build(e.to_string()))??;

        let dockerfile = opts
            .dockerfile
            .as_deref()
            .map(|d| rebase_dockerfile(&opts.context, d))
            .unwrap_or_else(|| "Dockerfile".to_string());

        let build_options = BuildImageOptions {
            dockerfile,
            t: primary_tag.clone(),
            buildargs: opts
                .args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<String, String>>(),
            target: opts.target.clone().unwrap_or_default(),
            nocache: opts.no_cache,
            rm: true,
            ..Default::default()
        };

        let mut build_stream =
            self.client()
                .build_image(build_options, None, Some(tarball.into()));

        let mut image_id: Option<String> = None;

        let streaming = async {
            while let Some(item) = build_stream.next().await {
                if cancel.is_cancelled() {
                    return Err(DockerError::Cancelled);
                }
                let info = item.map_err(|e| DockerError::Build(e.to_string()))?;

                if let Some(error) = info.error {
                    let detail = info
                        .error_detail
                        .and_then(|d| d.message)
                        .unwrap_or_default();
                    return Err(DockerError::Build(if detail.is_empty() {
                        error
                    } else {
                        format!("{}: {}", error, detail)
                    }));
                }

                if let Some(aux) = info.aux {
                    if let Some(id) = aux.id {
                        image_id = Some(id);
                    }
                }

                for raw in info
                    .stream
                    .iter()
                    .chain(info.status.iter())
                    .flat_map(|chunk| chunk.lines())
                {
                    let line = raw.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    if let Some(id) = parse_built_id(line) {
                        image_id = Some(id);
                    }
                    sinks.stdout.push_line(line);
                    if opts.verbose {
                        debug!("build: {}", line);
                    } else {
                        progress.emit(line);
                    }
                }
            }
            Ok(())
        };

        match tokio::time::timeout(opts.timeout, streaming).await {
            Ok(result) => result?,
            Err(_) => return Err(DockerError::BuildTimeout(opts.timeout)),
        }

        let image_id = image_id
            .ok_or_else(|| DockerError::Build("daemon reported no image id".to_string()))?;
        info!("Built image {} ({})", primary_tag, short_id(&image_id));

        for tag in opts.tags.iter().skip(1) {
            let (repo, tag_name) = split_tag(tag);
            self.client()
                .tag_image(
                    &image_id,
                    Some(TagImageOptions {
                        repo,
                        tag: tag_name,
                    }),
                )
                .await?;
        }

        let size = self
            .client()
            .inspect_image(&image_id)
            .await
            .ok()
            .and_then(|i| i.size)
            .unwrap_or(0);

        Ok(BuildOutcome {
            image_id,
            tags: opts.tags.clone(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_rebase_dockerfile() {
        let context = Path::new("/src/app");
        assert_eq!(
            rebase_dockerfile(context, "/src/app/docker/Dockerfile.web"),
            "docker/Dockerfile.web"
        );
        assert_eq!(rebase_dockerfile(context, "Dockerfile"), "Dockerfile");
        assert_eq!(
            rebase_dockerfile(context, "/elsewhere/Dockerfile"),
            "Dockerfile"
        );
    }

    #[test]
    fn test_split_tag() {
        assert_eq!(split_tag("app:v1"), ("app", "v1"));
        assert_eq!(split_tag("app"), ("app", "latest"));
        assert_eq!(
            split_tag("registry.local:5000/team/app"),
            ("registry.local:5000/team/app", "latest")
        );
        assert_eq!(
            split_tag("registry.local:5000/team/app:v2"),
            ("registry.local:5000/team/app", "v2")
        );
    }

    #[test]
    fn test_parse_built_id() {
        assert_eq!(
            parse_built_id("Successfully built 0123abcd").as_deref(),
            Some("0123abcd")
        );
        assert_eq!(parse_built_id("Step 3/7 : RUN make"), None);
    }

    #[test]
    fn test_tar_context_applies_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join("app.py"), "print()\n").unwrap();
        std::fs::write(dir.path().join("ignored.log"), "x\n").unwrap();
        std::fs::write(dir.path().join(".dockerignore"), "*.log\n").unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules").join("pkg.js"), "x\n").unwrap();

        let data = tar_context(dir.path()).unwrap();

        let mut archive = tar::Archive::new(data.as_slice());
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().to_string());
        }

        assert!(names.contains(&"Dockerfile".to_string()));
        assert!(names.contains(&"app.py".to_string()));
        assert!(!names.iter().any(|n| n.contains("node_modules")));
        assert!(!names.contains(&"ignored.log".to_string()));
    }
}
