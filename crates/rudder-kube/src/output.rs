//! Output aggregation: buffer or filesystem
//!
//! CRDs are emitted first and verbatim, followed by the sorted manifests.
//! In buffered mode the result is one `# Source:` framed string; in
//! filesystem mode each document is written under its source path, the first
//! write to a path truncating it and later writes appending.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use rudder_core::CrdObject;
use tracing::{debug, info};

use crate::error::{KubeError, Result};
use crate::manifest::{Manifest, frame};
use crate::postrender::PostRenderer;

/// Where rendered output goes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputTarget {
    /// Collect into a single string
    #[default]
    Buffer,
    /// Write files under `dir`; manifests go under `dir/<release>` when
    /// `release_dir` is set, CRDs always directly under `dir`
    Directory {
        dir: PathBuf,
        release_dir: Option<String>,
    },
}

/// Collects CRDs and manifests into the configured target
#[derive(Debug)]
pub struct OutputAggregator {
    target: OutputTarget,
    buffer: String,
    written: HashSet<PathBuf>,
}

impl OutputAggregator {
    pub fn new(target: OutputTarget) -> Self {
        Self {
            target,
            buffer: String::new(),
            written: HashSet::new(),
        }
    }

    /// Emit a CRD file verbatim
    pub fn add_crd(&mut self, crd: &CrdObject<'_>) -> Result<()> {
        match &self.target {
            OutputTarget::Buffer => {
                self.buffer.push_str(&frame(&crd.filename, &crd.file.data));
                Ok(())
            }
            OutputTarget::Directory { dir, .. } => {
                let dir = dir.clone();
                self.write_file(&dir, &crd.filename, &crd.file.data)
            }
        }
    }

    pub fn add_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        match &self.target {
            OutputTarget::Buffer => {
                self.buffer.push_str(&frame(&manifest.name, &manifest.content));
                Ok(())
            }
            OutputTarget::Directory { dir, release_dir } => {
                let dir = match release_dir {
                    Some(release) => dir.join(release),
                    None => dir.clone(),
                };
                self.write_file(&dir, &manifest.name, &manifest.content)
            }
        }
    }

    fn write_file(&mut self, dir: &Path, name: &str, content: &str) -> Result<()> {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let append = !self.written.insert(path.clone());
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;
        file.write_all(frame(name, content).as_bytes())?;

        info!("wrote {}", path.display());
        Ok(())
    }

    /// Finish aggregation, running the post-renderer over the buffer.
    ///
    /// In filesystem mode the returned buffer is empty and no post-renderer runs.
    pub async fn finish(self, post_renderer: Option<&dyn PostRenderer>) -> Result<String> {
        if let OutputTarget::Directory { .. } = self.target {
            if post_renderer.is_some() {
                debug!("post-renderer skipped for filesystem output");
            }
            return Ok(String::new());
        }

        match post_renderer {
            None => Ok(self.buffer),
            Some(renderer) => renderer.run(self.buffer).await.map_err(|e| match e {
                KubeError::PostRender(_) => e,
                other => KubeError::PostRender(other.to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SimpleHead;
    use async_trait::async_trait;
    use rudder_core::ChartFile;

    fn manifest(name: &str, content: &str) -> Manifest {
        Manifest {
            name: name.to_string(),
            content: content.to_string(),
            head: SimpleHead::default(),
        }
    }

    struct Upper;

    #[async_trait]
    impl PostRenderer for Upper {
        async fn run(&self, rendered: String) -> Result<String> {
            Ok(rendered.to_uppercase())
        }
    }

    struct Broken;

    #[async_trait]
    impl PostRenderer for Broken {
        async fn run(&self, _rendered: String) -> Result<String> {
            Err(KubeError::Io(std::io::Error::other("pipe closed")))
        }
    }

    #[tokio::test]
    async fn test_buffer_crds_first() {
        let file = ChartFile::new("crds/widget.yaml", "kind: CustomResourceDefinition");
        let crd = CrdObject {
            name: "widget.yaml",
            filename: "web/crds/widget.yaml".to_string(),
            file: &file,
        };

        let mut out = OutputAggregator::new(OutputTarget::Buffer);
        out.add_crd(&crd).unwrap();
        out.add_manifest(&manifest("web/templates/svc.yaml", "kind: Service")).unwrap();

        assert_eq!(
            out.finish(None).await.unwrap(),
            "---\n# Source: web/crds/widget.yaml\nkind: CustomResourceDefinition\n\
             ---\n# Source: web/templates/svc.yaml\nkind: Service\n"
        );
    }

    #[tokio::test]
    async fn test_post_renderer_runs_once() {
        let mut out = OutputAggregator::new(OutputTarget::Buffer);
        out.add_manifest(&manifest("a.yaml", "kind: x")).unwrap();
        out.add_manifest(&manifest("b.yaml", "kind: y")).unwrap();

        let result = out.finish(Some(&Upper)).await.unwrap();
        assert_eq!(result, "---\n# SOURCE: A.YAML\nKIND: X\n---\n# SOURCE: B.YAML\nKIND: Y\n");
    }

    #[tokio::test]
    async fn test_post_renderer_failure_wrapped() {
        let mut out = OutputAggregator::new(OutputTarget::Buffer);
        out.add_manifest(&manifest("a.yaml", "kind: x")).unwrap();

        let err = out.finish(Some(&Broken)).await.unwrap_err();
        assert!(matches!(err, KubeError::PostRender(_)));
        assert!(err.to_string().starts_with("error while running post render on files"));
    }

    #[tokio::test]
    async fn test_directory_truncate_then_append() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("myapp/web/templates/all.yaml");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "stale content\n").unwrap();

        let file = ChartFile::new("crds/w.yaml", "kind: CustomResourceDefinition");
        let crd = CrdObject {
            name: "w.yaml",
            filename: "web/crds/w.yaml".to_string(),
            file: &file,
        };

        let mut out = OutputAggregator::new(OutputTarget::Directory {
            dir: tmp.path().to_path_buf(),
            release_dir: Some("myapp".to_string()),
        });
        out.add_crd(&crd).unwrap();
        out.add_manifest(&manifest("web/templates/all.yaml", "kind: A")).unwrap();
        out.add_manifest(&manifest("web/templates/all.yaml", "kind: B")).unwrap();
        assert_eq!(out.finish(Some(&Upper)).await.unwrap(), "");

        let written = std::fs::read_to_string(&stale).unwrap();
        assert_eq!(
            written,
            "---\n# Source: web/templates/all.yaml\nkind: A\n---\n# Source: web/templates/all.yaml\nkind: B\n"
        );

        let crd_path = tmp.path().join("web/crds/w.yaml");
        assert!(crd_path.exists());
        assert!(!tmp.path().join("myapp/web/crds/w.yaml").exists());
    }
}
