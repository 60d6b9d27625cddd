use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SidecarConfig;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TextItem {
    pub shape_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_title: bool,
    #[serde(default)]
    pub table: Option<Vec<Vec<String>>>,
}

impl TextItem {
    /// Every translatable string in this shape, table cells included.
    pub fn strings(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.text.as_deref().into_iter().collect();
        if let Some(rows) = &self.table {
            out.extend(rows.iter().flatten().map(String::as_str));
        }
        out.retain(|s| !s.trim().is_empty());
        out
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SlideText {
    pub slide_number: u32,
    #[serde(default)]
    pub texts: Vec<TextItem>,
}

/// Output of the extraction script.
#[derive(Debug, Clone, Deserialize)]
pub struct Extraction {
    pub success: bool,
    #[serde(default)]
    pub total_slides: usize,
    #[serde(default)]
    pub slides: Vec<SlideText>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPair {
    pub original: String,
    pub translated: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlideTranslations {
    pub slide_number: u32,
    pub translations: Vec<TextPair>,
}

/// Input of the apply script.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TranslationDoc {
    pub slides: Vec<SlideTranslations>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyOutcome {
    pub success: bool,
    #[serde(default)]
    pub applied_count: usize,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Runs the document-processing scripts as child processes.
///
/// Each script prints a single JSON object on stdout.
#[derive(Debug, Clone)]
pub struct Sidecar {
    interpreter: String,
    extract_script: PathBuf,
    apply_script: PathBuf,
    timeout: Duration,
}

impl Sidecar {
    pub fn new(config: &SidecarConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            extract_script: PathBuf::from(&config.extract_script),
            apply_script: PathBuf::from(&config.apply_script),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn run(&self, script: &Path, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(script = %script.display(), "running sidecar");
        let child = cmd
            .spawn()
            .with_context(|| format!("spawning {} {}", self.interpreter, script.display()))?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.context("waiting for sidecar")?,
            Err(_) => bail!("sidecar {} timed out after {:?}", script.display(), self.timeout),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, stderr = %stderr.trim(), "sidecar exited with failure");
            // scripts report their own errors as JSON on stdout
            if stdout.trim().is_empty() {
                bail!("sidecar exited with {}: {}", output.status, stderr.trim());
            }
        }
        Ok(stdout)
    }

    pub async fn extract(&self, input: &Path) -> Result<Extraction> {
        let input = input.to_string_lossy();
        let stdout = self.run(&self.extract_script, &[&input]).await?;
        let extraction: Extraction =
            serde_json::from_str(stdout.trim()).context("parsing extraction output")?;
        if !extraction.success {
            bail!(
                "text extraction failed: {}",
                extraction.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(extraction)
    }

    /// Writes `doc` next to `output` and has the apply script produce the
    /// translated document.
    pub async fn apply(&self, input: &Path, output: &Path, doc: &TranslationDoc) -> Result<ApplyOutcome> {
        let doc_path = output.with_extension("translations.json");
        tokio::fs::write(&doc_path, serde_json::to_vec(doc)?)
            .await
            .with_context(|| format!("writing {}", doc_path.display()))?;

        let args = [
            input.to_string_lossy(),
            output.to_string_lossy(),
            doc_path.to_string_lossy(),
        ];
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        let result = self.run(&self.apply_script, &args).await;
        if let Err(e) = tokio::fs::remove_file(&doc_path).await {
            debug!(error = %e, "could not remove translations file");
        }

        let outcome: ApplyOutcome =
            serde_json::from_str(result?.trim()).context("parsing apply output")?;
        if !outcome.success {
            bail!(
                "applying translations failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(outcome)
    }
}
