//! Seams to the external providers: code generation, vision scoring, and the
//! page probe (screenshots + overflow scans).
//!
//! Real implementations shell out to configured commands; tests substitute
//! doubles. The orchestrator treats all three as opaque.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Viewport a capture runs at.
#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

/// An element wider than its container with overflow left visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverflowOffender {
    pub selector: String,
    pub tag: String,
    pub scroll_width: f64,
    pub client_width: f64,
    pub overflow_px: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figma_node_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverflowReport {
    #[serde(default)]
    pub offenders: Vec<OverflowOffender>,
}

impl OverflowReport {
    /// The worst offenders, for the next iteration's prompt context.
    pub fn top(&self, n: usize) -> Vec<OverflowOffender> {
        let mut sorted = self.offenders.clone();
        sorted.sort_by(|a, b| {
            b.overflow_px
                .partial_cmp(&a.overflow_px)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted.truncate(n);
        sorted
    }
}

#[async_trait]
pub trait CodeGenProvider: Send + Sync {
    /// Produce the raw model response for a prompt. Cancellation is the
    /// caller's concern: the orchestrator races this future against its stop
    /// signal and drops it when tripped.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[async_trait]
pub trait VisionScorer: Send + Sync {
    /// Compare a candidate screenshot against its baseline. Returns the raw
    /// JSON response; shape validation and the neutral fallback happen in the
    /// scoring step.
    async fn score(
        &self,
        baseline_png: &Path,
        candidate_png: &Path,
        ir_summary: &str,
    ) -> Result<serde_json::Value>;
}

#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Render `url` at the viewport and write a PNG to `out_path`. Returns
    /// the file size in bytes.
    async fn screenshot(&self, url: &str, viewport: Viewport, out_path: &Path) -> Result<u64>;

    /// Enumerate overflow offenders under the app root at the viewport.
    async fn overflow_scan(&self, url: &str, viewport: Viewport) -> Result<OverflowReport>;
}

// ── Subprocess-backed implementations ────────────────────────────────

async fn run_with_stdin(cmd: &[String], stdin_data: &str, args: &[String]) -> Result<String> {
    let (program, base_args) = cmd
        .split_first()
        .context("provider command is empty")?;
    let mut child = Command::new(program)
        .args(base_args)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn provider '{program}'"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(stdin_data.as_bytes())
            .await
            .context("Failed to write provider stdin")?;
        stdin.shutdown().await.context("Failed to close provider stdin")?;
    }

    let output = child
        .wait_with_output()
        .await
        .context("Failed to wait for provider")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "provider '{program}' exited with {:?}: {}",
            output.status.code(),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Code generation via a configured command: prompt on stdin, response on
/// stdout.
pub struct CliCodeGen {
    cmd: Vec<String>,
}

impl CliCodeGen {
    pub fn new(cmd: Vec<String>) -> Self {
        Self { cmd }
    }
}

#[async_trait]
impl CodeGenProvider for CliCodeGen {
    async fn generate(&self, prompt: &str) -> Result<String> {
        run_with_stdin(&self.cmd, prompt, &[]).await
    }
}

/// Vision scoring via a configured command: image paths as arguments, the IR
/// summary on stdin, JSON scores on stdout.
pub struct CliScorer {
    cmd: Vec<String>,
}

impl CliScorer {
    pub fn new(cmd: Vec<String>) -> Self {
        Self { cmd }
    }
}

#[async_trait]
impl VisionScorer for CliScorer {
    async fn score(
        &self,
        baseline_png: &Path,
        candidate_png: &Path,
        ir_summary: &str,
    ) -> Result<serde_json::Value> {
        let args = vec![
            baseline_png.display().to_string(),
            candidate_png.display().to_string(),
        ];
        let stdout = run_with_stdin(&self.cmd, ir_summary, &args).await?;
        // A response that is not JSON at all still reaches the neutral
        // fallback in the scoring step.
        Ok(serde_json::from_str(&stdout).unwrap_or(serde_json::Value::Null))
    }
}

/// Browser driving via a configured command with `screenshot` and
/// `overflow-scan` subcommands.
pub struct CliProbe {
    cmd: Vec<String>,
}

impl CliProbe {
    pub fn new(cmd: Vec<String>) -> Self {
        Self { cmd }
    }

    fn viewport_args(viewport: Viewport) -> Vec<String> {
        vec![
            "--width".to_string(),
            viewport.width.to_string(),
            "--height".to_string(),
            viewport.height.to_string(),
            "--scale".to_string(),
            viewport.device_scale_factor.to_string(),
        ]
    }
}

#[async_trait]
impl PageProbe for CliProbe {
    async fn screenshot(&self, url: &str, viewport: Viewport, out_path: &Path) -> Result<u64> {
        let mut args = vec!["screenshot".to_string(), "--url".to_string(), url.to_string()];
        args.extend(Self::viewport_args(viewport));
        args.push("--out".to_string());
        args.push(out_path.display().to_string());
        run_with_stdin(&self.cmd, "", &args).await?;

        let meta = tokio::fs::metadata(out_path)
            .await
            .context("probe reported success but wrote no screenshot")?;
        Ok(meta.len())
    }

    async fn overflow_scan(&self, url: &str, viewport: Viewport) -> Result<OverflowReport> {
        let mut args = vec![
            "overflow-scan".to_string(),
            "--url".to_string(),
            url.to_string(),
        ];
        args.extend(Self::viewport_args(viewport));
        let stdout = run_with_stdin(&self.cmd, "", &args).await?;
        serde_json::from_str(&stdout).context("overflow scan emitted malformed JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offender(selector: &str, overflow_px: f64) -> OverflowOffender {
        OverflowOffender {
            selector: selector.to_string(),
            tag: "div".to_string(),
            scroll_width: 1000.0 + overflow_px,
            client_width: 1000.0,
            overflow_px,
            figma_node_id: None,
        }
    }

    #[test]
    fn test_overflow_top_sorts_and_caps() {
        let report = OverflowReport {
            offenders: vec![offender("a", 3.0), offender("b", 40.0), offender("c", 12.0)],
        };
        let top = report.top(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].selector, "b");
        assert_eq!(top[1].selector, "c");
    }

    #[test]
    fn test_overflow_report_round_trip() {
        let json = serde_json::json!({
            "offenders": [{
                "selector": "main > div.row",
                "tag": "div",
                "scrollWidth": 1460.0,
                "clientWidth": 1440.0,
                "overflowPx": 20.0,
                "figmaNodeId": "12:34"
            }]
        })
        .to_string();
        let report: OverflowReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report.offenders.len(), 1);
        assert_eq!(report.offenders[0].figma_node_id.as_deref(), Some("12:34"));
        assert_eq!(report.offenders[0].overflow_px, 20.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_codegen_pipes_prompt_through() {
        let provider = CliCodeGen::new(vec!["cat".to_string()]);
        let response = provider.generate("hello provider").await.unwrap();
        assert_eq!(response, "hello provider");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_codegen_surfaces_failure() {
        let provider = CliCodeGen::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo boom >&2; exit 2".to_string(),
        ]);
        let err = provider.generate("x").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_scorer_tolerates_non_json() {
        let scorer = CliScorer::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'I cannot score this'".to_string(),
        ]);
        let value = scorer
            .score(Path::new("/tmp/a.png"), Path::new("/tmp/b.png"), "{}")
            .await
            .unwrap();
        assert!(value.is_null());
    }
}
