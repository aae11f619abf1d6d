//! Local side-effect rendering.
//!
//! After an apply, outputs are resolved against final state and substituted
//! into template files, for example an SSH client stanza pointing at the new
//! machine. The template variant is chosen by host OS.

mod outputs;
mod template;

pub use outputs::resolve_outputs;
pub use template::Template;

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, HalyardError, RenderError, Result};
use crate::graph::RenderTarget;
use crate::graph::expr::value_to_text;
use crate::state::{ArtifactState, OutputValue};

/// A file produced by the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    /// Render name.
    pub name: String,
    /// Template file used.
    pub template: PathBuf,
    /// Rendered content.
    pub content: String,
    /// State record for the written file.
    pub state: ArtifactState,
}

/// Renders templates into local files.
#[derive(Debug, Clone)]
pub struct Renderer {
    host_os: String,
    home: Option<PathBuf>,
}

impl Renderer {
    /// Creates a renderer selecting variants for `host_os`.
    #[must_use]
    pub fn new(host_os: &str) -> Self {
        Self {
            host_os: host_os.to_string(),
            home: dirs::home_dir(),
        }
    }

    /// Overrides the directory `~/` expands to.
    #[must_use]
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Returns the host OS used for variant selection.
    #[must_use]
    pub fn host_os(&self) -> &str {
        &self.host_os
    }

    /// Expands a leading `~/` in a target path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path needs a home directory and none is known.
    pub fn expand_path(&self, path: &Path) -> std::result::Result<PathBuf, RenderError> {
        let Ok(rest) = path.strip_prefix("~") else {
            return Ok(path.to_path_buf());
        };
        self.home
            .as_ref()
            .map(|home| home.join(rest))
            .ok_or_else(|| RenderError::WriteFailed {
                path: path.to_path_buf(),
                message: String::from("no home directory to expand '~'"),
            })
    }

    /// Renders one target without writing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be read or parsed or uses a
    /// placeholder with no output.
    pub async fn render(
        &self,
        target: &RenderTarget,
        outputs: &BTreeMap<String, OutputValue>,
    ) -> Result<RenderedArtifact> {
        let template_path = target.template_for(&self.host_os);
        debug!(
            "Rendering {} from {} for {}",
            target.name,
            template_path.display(),
            self.host_os
        );

        let source = fs::read_to_string(template_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HalyardError::Config(ConfigError::FileNotFound {
                    path: template_path.clone(),
                })
            } else {
                HalyardError::Io(e)
            }
        })?;

        let template = Template::parse(&target.name, &source)?;
        let values: BTreeMap<String, String> = outputs
            .iter()
            .map(|(name, output)| (name.clone(), value_to_text(&output.value)))
            .collect();
        let content = template.render(&values)?;
        let path = self.expand_path(&target.path)?;

        Ok(RenderedArtifact {
            name: target.name.clone(),
            template: template_path.clone(),
            state: ArtifactState {
                path,
                content_hash: content_hash(&content),
                rendered_at: Utc::now(),
            },
            content,
        })
    }

    /// Renders and writes every target.
    ///
    /// # Errors
    ///
    /// Returns the first render or write failure.
    pub async fn render_all(
        &self,
        targets: &[RenderTarget],
        outputs: &BTreeMap<String, OutputValue>,
    ) -> Result<Vec<RenderedArtifact>> {
        let mut rendered = Vec::with_capacity(targets.len());
        for target in targets {
            let artifact = self.render(target, outputs).await?;
            write_artifact(&artifact).await?;
            info!("Rendered {} to {}", artifact.name, artifact.state.path.display());
            rendered.push(artifact);
        }
        Ok(rendered)
    }
}

/// Removes previously rendered files.
///
/// A file whose content no longer matches the recorded hash was edited by
/// hand and is left in place. Returns the paths actually removed.
///
/// # Errors
///
/// Returns an error if an unchanged file cannot be removed.
pub async fn remove_artifacts(artifacts: &BTreeMap<String, ArtifactState>) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for (name, artifact) in artifacts {
        let content = match fs::read_to_string(&artifact.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Artifact {name} already removed");
                continue;
            }
            Err(e) => return Err(HalyardError::Io(e)),
        };

        if content_hash(&content) != artifact.content_hash {
            warn!(
                "Leaving {} in place: it changed since it was rendered",
                artifact.path.display()
            );
            continue;
        }

        fs::remove_file(&artifact.path).await.map_err(|e| {
            HalyardError::Render(RenderError::WriteFailed {
                path: artifact.path.clone(),
                message: e.to_string(),
            })
        })?;
        info!("Removed {}", artifact.path.display());
        removed.push(artifact.path.clone());
    }
    Ok(removed)
}

async fn write_artifact(artifact: &RenderedArtifact) -> Result<()> {
    let path = &artifact.state.path;
    let write_failed = |e: std::io::Error| {
        HalyardError::Render(RenderError::WriteFailed {
            path: path.clone(),
            message: e.to_string(),
        })
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(write_failed)?;
    }
    fs::write(path, artifact.content.as_bytes())
        .await
        .map_err(write_failed)
}

fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
