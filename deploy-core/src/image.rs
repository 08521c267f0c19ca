//! Image Packager (C4): assembles a build context, builds an image for the
//! target platform, and exports it to a portable tarball.
//!
//! Build/export is grounded in the teacher's `core::client::Client::build_image`
//! (buildkit session, streamed log lines) and `Client::pull_image`. The
//! context layout and the early hosted-model accessibility check are
//! grounded in `original_source/core/model_deployer/deployer/deployer.py`'s
//! `_build_docker_image` and the Hugging Face `HfApi().model_info` call.

use std::path::{Path, PathBuf};

use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures::stream::StreamExt;
use tempfile::TempDir;

use crate::error::{BuildError, ConfigurationError};
use crate::model::ModelRef;

/// Fixed manifest of runtime dependencies for the inference server,
/// analogous to `scripts.ALL_REQUIREMENTS` in the original.
const DEFAULT_REQUIREMENTS: &str = "flask\ntorch\ntransformers\nhuggingface_hub\n";

/// Container build recipe: installs the manifest, copies the artifacts,
/// declares the default port, exposes a range, and sets the entrypoint.
fn default_recipe() -> &'static str {
    r#"FROM python:3.11-slim
WORKDIR /app
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt
COPY core/ ./core/
COPY model/ ./model/
COPY inference_script.py .
COPY entrypoint.sh .
RUN chmod +x entrypoint.sh
EXPOSE 8000-9000
ENTRYPOINT ["./entrypoint.sh"]
"#
}

fn default_entrypoint() -> &'static str {
    "#!/bin/sh\nexec python inference_script.py --model-dir /app/model --port \"$PORT\"\n"
}

/// A build context scoped to a single [`crate::deploy`] invocation. The
/// `TempDir` guard deletes the directory on every exit path, including
/// early error returns, matching the quantified invariant in spec §8.
pub struct BuildContext {
    root: TempDir,
}

impl BuildContext {
    pub fn path(&self) -> &Path {
        self.root.path()
    }
}

pub struct ImagePackager;

impl ImagePackager {
    /// Checks hosted-model accessibility before any heavy work begins. A
    /// private model with no token fails fast with
    /// [`ConfigurationError`]-shaped detail surfaced by the caller as
    /// `HostedModelUnavailable`.
    pub async fn check_hosted_model_accessible(
        repo_id: &str,
        token: Option<&str>,
    ) -> Result<(), String> {
        let client = reqwest::Client::new();
        let url = format!("https://huggingface.co/api/models/{repo_id}");
        let mut request = client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| format!("failed to query model info for '{repo_id}': {e}"))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            if token.is_none() {
                return Err(format!(
                    "the model '{repo_id}' is private and no token was provided"
                ));
            }
            return Err(format!(
                "access to model '{repo_id}' was denied with the provided token"
            ));
        }
        if !response.status().is_success() {
            return Err(format!(
                "failed to retrieve model info for '{repo_id}': HTTP {}",
                response.status()
            ));
        }
        Ok(())
    }

    /// Assembles the build context: `model/`, `entrypoint`, `inference_script`,
    /// `requirements`, `core/`, `recipe`.
    pub fn assemble(
        model_ref: &ModelRef,
        inference_script: &Path,
        core_dir: Option<&Path>,
    ) -> Result<BuildContext, BuildError> {
        let root = TempDir::new().map_err(BuildError::Context)?;
        let model_dir = root.path().join("model");
        std::fs::create_dir_all(&model_dir).map_err(BuildError::Context)?;

        match model_ref {
            ModelRef::Local(path) => {
                if path.is_dir() {
                    copy_dir_recursive(path, &model_dir).map_err(BuildError::Context)?;
                } else {
                    let dest = model_dir.join(path.file_name().unwrap_or_default());
                    std::fs::copy(path, dest).map_err(BuildError::Context)?;
                }
            }
            ModelRef::Hosted { repo_id, .. } => {
                std::fs::write(model_dir.join("hf_model_link.txt"), repo_id)
                    .map_err(BuildError::Context)?;
            }
        }

        std::fs::copy(inference_script, root.path().join("inference_script.py"))
            .map_err(BuildError::Context)?;
        std::fs::write(root.path().join("requirements.txt"), DEFAULT_REQUIREMENTS)
            .map_err(BuildError::Context)?;
        std::fs::write(root.path().join("entrypoint.sh"), default_entrypoint())
            .map_err(BuildError::Context)?;
        std::fs::write(root.path().join("Dockerfile"), default_recipe())
            .map_err(BuildError::Context)?;

        let core_dest = root.path().join("core");
        if let Some(core_dir) = core_dir {
            copy_dir_recursive(core_dir, &core_dest).map_err(BuildError::Context)?;
        } else {
            std::fs::create_dir_all(&core_dest).map_err(BuildError::Context)?;
        }

        Ok(BuildContext { root })
    }

    /// Invokes the Docker builder targeting `platform_string` (e.g.
    /// `linux/amd64`), streaming build log lines the way
    /// `Client::build_image` does.
    pub async fn build(
        docker: &Docker,
        context: &BuildContext,
        image_tag: &str,
        platform_string: &str,
    ) -> Result<String, BuildError> {
        let tar_bytes = build_context_tar(context.path()).map_err(BuildError::Context)?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: image_tag,
            platform: platform_string,
            rm: true,
            ..Default::default()
        };

        let mut stream = docker.build_image(options, None, Some(tar_bytes.into()));
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(info) => {
                    if let Some(stream_line) = info.stream {
                        log::info!("build: {}", stream_line.trim_end());
                    }
                    if let Some(error) = info.error {
                        return Err(BuildError::Docker {
                            image_tag: image_tag.to_string(),
                            source: bollard::errors::Error::DockerResponseServerError {
                                status_code: 500,
                                message: error,
                            },
                        });
                    }
                }
                Err(source) => {
                    return Err(BuildError::Docker {
                        image_tag: image_tag.to_string(),
                        source,
                    })
                }
            }
        }

        Ok(image_tag.to_string())
    }

    /// Serializes the image to a portable tar on the operator host.
    pub async fn export(
        docker: &Docker,
        image_tag: &str,
        out_dir: &Path,
    ) -> Result<PathBuf, BuildError> {
        let base = image_tag.split(':').next().unwrap_or(image_tag);
        let tar_path = out_dir.join(format!("{base}.tar"));
        let mut file = tokio::fs::File::create(&tar_path)
            .await
            .map_err(BuildError::Context)?;

        let mut stream = docker.export_image(image_tag);
        use tokio::io::AsyncWriteExt;
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|source| BuildError::Export {
                image_tag: image_tag.to_string(),
                source,
            })?;
            file.write_all(&bytes).await.map_err(BuildError::Context)?;
        }

        Ok(tar_path)
    }

    /// Removes temporary contexts on all paths. With `BuildContext` owning a
    /// `TempDir`, dropping it is sufficient; this is an explicit entry point
    /// for callers that want cleanup to happen before the end of a scope
    /// (e.g. on an early error return they still hold the context).
    pub fn cleanup(context: BuildContext) {
        drop(context);
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}

fn build_context_tar(root: &Path) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buffer);
        builder.append_dir_all(".", root)?;
        builder.finish()?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_writes_hosted_model_link_not_a_download() {
        let model_ref = ModelRef::Hosted {
            repo_id: "org/name".to_string(),
            token: None,
        };
        let script = std::env::temp_dir().join("modeldeploy_test_script.py");
        std::fs::write(&script, "# test").unwrap();

        let context = ImagePackager::assemble(&model_ref, &script, None).unwrap();
        let link = std::fs::read_to_string(context.path().join("model/hf_model_link.txt"))
            .unwrap();
        assert_eq!(link, "org/name");

        std::fs::remove_file(&script).ok();
    }

    #[test]
    fn assemble_copies_local_model_file() {
        let model_file = std::env::temp_dir().join("modeldeploy_test_model.bin");
        std::fs::write(&model_file, b"weights").unwrap();
        let script = std::env::temp_dir().join("modeldeploy_test_script2.py");
        std::fs::write(&script, "# test").unwrap();

        let model_ref = ModelRef::Local(model_file.clone());
        let context = ImagePackager::assemble(&model_ref, &script, None).unwrap();
        let copied = context.path().join("model").join(model_file.file_name().unwrap());
        assert!(copied.exists());

        std::fs::remove_file(&model_file).ok();
        std::fs::remove_file(&script).ok();
    }

    #[test]
    fn build_context_is_removed_when_dropped() {
        let model_ref = ModelRef::Hosted {
            repo_id: "org/name".to_string(),
            token: None,
        };
        let script = std::env::temp_dir().join("modeldeploy_test_script3.py");
        std::fs::write(&script, "# test").unwrap();

        let context = ImagePackager::assemble(&model_ref, &script, None).unwrap();
        let path = context.path().to_path_buf();
        assert!(path.exists());
        ImagePackager::cleanup(context);
        assert!(!path.exists());

        std::fs::remove_file(&script).ok();
    }
}
