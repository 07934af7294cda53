//! Image export/import tool.
//!
//! [`ImageTool`] turns image references into an unpacked export directory
//! and back. [`DockerCli`] drives the `docker` binary; archives are packed
//! and unpacked in-process with the `tar` crate.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use dlc_core::error::{CacheError, Result};
use tokio::process::Command;

/// An image known to the local daemon: `(id, repository:tag)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub repo_tag: String,
}

/// External image export/import tool.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Ids of the intermediate images in `image`'s history.
    async fn history(&self, image: &str) -> Result<Vec<String>>;

    /// Export `images` into `dest_dir` as an unpacked archive.
    async fn export(&self, images: &[String], dest_dir: &Path) -> Result<()>;

    /// Import the unpacked archive at `src_dir`.
    async fn import(&self, src_dir: &Path) -> Result<()>;

    /// Images currently present, optionally narrowed by a filter.
    async fn list_images(&self, filter: Option<&str>) -> Result<Vec<ImageRecord>>;
}

/// Output of a finished command.
#[derive(Debug)]
struct CommandOutput {
    status: i32,
    stdout: String,
    stderr: String,
}

/// [`ImageTool`] backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
        }
    }
}

impl DockerCli {
    /// Use a specific docker-compatible binary.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> =
            args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let command_line = format!(
            "{} {}",
            self.binary.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        tracing::debug!(command = %command_line, "Running command");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CacheError::CommandError {
                command: command_line.clone(),
                message: e.to_string(),
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ImageTool for DockerCli {
    async fn history(&self, image: &str) -> Result<Vec<String>> {
        let output = self.run(["history", "-q", image]).await?;
        if output.status != 0 {
            return Err(CacheError::CommandError {
                command: format!("docker history -q {}", image),
                message: output.stderr,
            });
        }
        Ok(parse_history(&output.stdout))
    }

    async fn export(&self, images: &[String], dest_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let archive = tempfile::Builder::new()
            .prefix("dlc-save-")
            .suffix(".tar")
            .tempfile()?
            .into_temp_path();

        let mut args = vec!["save".to_string(), "-o".to_string()];
        args.push(archive.to_string_lossy().to_string());
        args.extend(images.iter().cloned());
        let output = self.run(&args).await?;
        if output.status != 0 {
            return Err(CacheError::ExportFailure {
                status: output.status,
                message: output.stderr,
            });
        }

        let archive_path = archive.to_path_buf();
        let dest = dest_dir.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_tar(&archive_path, &dest))
            .await
            .map_err(|e| CacheError::Other(format!("Unpack task failed: {}", e)))?
            .map_err(|e| CacheError::ExportFailure {
                status: -1,
                message: format!("Failed to unpack exported images: {}", e),
            })?;

        tracing::info!(images = images.len(), dest = %dest_dir.display(), "Exported images");
        Ok(())
    }

    async fn import(&self, src_dir: &Path) -> Result<()> {
        let archive = tempfile::Builder::new()
            .prefix("dlc-load-")
            .suffix(".tar")
            .tempfile()?
            .into_temp_path();

        let archive_path = archive.to_path_buf();
        let src = src_dir.to_path_buf();
        tokio::task::spawn_blocking(move || pack_tar(&src, &archive_path))
            .await
            .map_err(|e| CacheError::Other(format!("Pack task failed: {}", e)))?
            .map_err(|e| CacheError::ImportFailure {
                status: -1,
                message: format!("Failed to pack {}: {}", src_dir.display(), e),
            })?;

        let output = self
            .run([OsStr::new("load"), OsStr::new("-i"), archive.as_os_str()])
            .await?;
        if output.status != 0 {
            return Err(CacheError::ImportFailure {
                status: output.status,
                message: output.stderr,
            });
        }

        tracing::info!(output = %output.stdout, "Imported images");
        Ok(())
    }

    async fn list_images(&self, filter: Option<&str>) -> Result<Vec<ImageRecord>> {
        let mut args = vec![
            "image".to_string(),
            "ls".to_string(),
            "--format={{.ID}} {{.Repository}}:{{.Tag}}".to_string(),
            "--filter=dangling=false".to_string(),
        ];
        if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
            args.push(format!("--filter={}", filter));
        }
        let output = self.run(&args).await?;
        if output.status != 0 {
            return Err(CacheError::CommandError {
                command: "docker image ls".to_string(),
                message: output.stderr,
            });
        }
        Ok(parse_image_list(&output.stdout))
    }
}

/// Image ids from `docker history -q`, skipping `<missing>` rows.
pub fn parse_history(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|id| !id.is_empty() && *id != "<missing>")
        .map(str::to_string)
        .collect()
}

/// Records from `docker image ls --format '{{.ID}} {{.Repository}}:{{.Tag}}'`.
pub fn parse_image_list(stdout: &str) -> Vec<ImageRecord> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(2, ' ');
            let id = parts.next().filter(|s| !s.is_empty())?;
            let repo_tag = parts.next().unwrap_or_default();
            Some(ImageRecord {
                id: id.to_string(),
                repo_tag: repo_tag.to_string(),
            })
        })
        .collect()
}

fn unpack_tar(archive: &Path, dest: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(archive)?;
    tar::Archive::new(file).unpack(dest)
}

fn pack_tar(src: &Path, archive: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(archive)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src)?;
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_history_skips_missing() {
        let ids = parse_history("sha256:aaa\n<missing>\n\nsha256:bbb\n");
        assert_eq!(ids, vec!["sha256:aaa", "sha256:bbb"]);
    }

    #[test]
    fn test_parse_image_list() {
        let records = parse_image_list("abc123 app:latest\ndef456 <none>:<none>\n\n");
        assert_eq!(
            records,
            vec![
                ImageRecord {
                    id: "abc123".to_string(),
                    repo_tag: "app:latest".to_string()
                },
                ImageRecord {
                    id: "def456".to_string(),
                    repo_tag: "<none>:<none>".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_pack_then_unpack_preserves_files() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("aaa")).unwrap();
        fs::write(src.path().join("aaa/layer.tar"), "layer").unwrap();
        fs::write(src.path().join("manifest.json"), "[]").unwrap();

        let archive = out.path().join("image.tar");
        pack_tar(src.path(), &archive).unwrap();
        unpack_tar(&archive, dest.path()).unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("aaa/layer.tar")).unwrap(), "layer");
        assert_eq!(fs::read_to_string(dest.path().join("manifest.json")).unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_missing_binary_is_command_error() {
        let cli = DockerCli::with_binary("/nonexistent/docker-binary");
        let err = cli.history("app:latest").await.unwrap_err();
        assert!(matches!(err, CacheError::CommandError { .. }));
    }
}
