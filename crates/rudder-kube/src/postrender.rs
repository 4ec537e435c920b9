//! Post-render filters
//!
//! A post-renderer receives the fully assembled manifest buffer once and
//! returns a replacement, e.g. to run kustomize over the output.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{KubeError, Result};

/// Filter applied to the rendered manifest buffer
#[async_trait]
pub trait PostRenderer: Send + Sync {
    async fn run(&self, rendered: String) -> Result<String>;
}

/// Pipes the buffer through an external program (stdin to stdout)
#[derive(Debug, Clone)]
pub struct ExecPostRenderer {
    binary: PathBuf,
    args: Vec<String>,
}

impl ExecPostRenderer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl PostRenderer for ExecPostRenderer {
    async fn run(&self, rendered: String) -> Result<String> {
        debug!(binary = %self.binary.display(), "running post-renderer");

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                KubeError::PostRender(format!("failed to start {}: {}", self.binary.display(), e))
            })?;

        // stdin is fed while stdout is drained
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let result = stdin.write_all(rendered.as_bytes()).await;
                drop(stdin);
                result
            })
        });

        let output = child.wait_with_output().await?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // Child exited early; its status decides
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(KubeError::PostRender(e.to_string())),
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KubeError::PostRender(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| KubeError::PostRender(format!("output is not valid UTF-8: {}", e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_passthrough() {
        let renderer = ExecPostRenderer::new("cat");
        let out = renderer.run("kind: Service\n".to_string()).await.unwrap();
        assert_eq!(out, "kind: Service\n");
    }

    #[tokio::test]
    async fn test_exec_transforms() {
        let renderer = ExecPostRenderer::new("sh").with_args(["-c", "sed 's/web/api/'"]);
        let out = renderer.run("name: web\n".to_string()).await.unwrap();
        assert_eq!(out, "name: api\n");
    }

    #[tokio::test]
    async fn test_exec_failure_includes_stderr() {
        let renderer = ExecPostRenderer::new("sh").with_args(["-c", "cat >/dev/null; echo bad input >&2; exit 3"]);
        let err = renderer.run("x".to_string()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("error while running post render on files"));
        assert!(message.contains("bad input"));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let renderer = ExecPostRenderer::new("/nonexistent/post-renderer");
        assert!(matches!(
            renderer.run(String::new()).await,
            Err(KubeError::PostRender(_))
        ));
    }
}
