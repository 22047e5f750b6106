//! Release backend that shells out to the `helm` CLI
//!
//! Every command runs with `--output json` where helm supports it and is
//! bounded by [`HelmConfig::timeout`]. Chart archives and values documents
//! are written to temporary files that live for the duration of the call.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Release, ReleaseBackend};
use crate::Error;

/// Settings for the helm CLI backend
#[derive(Clone, Debug)]
pub struct HelmConfig {
    /// Path or name of the helm binary
    pub binary: PathBuf,
    /// Upper bound for a single helm invocation
    pub timeout: Duration,
    /// Optional kubeconfig context passed as `--kube-context`
    pub kube_context: Option<String>,
}

impl Default for HelmConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("helm"),
            timeout: Duration::from_secs(300),
            kube_context: None,
        }
    }
}

/// [`ReleaseBackend`] backed by the helm CLI
pub struct HelmCli {
    config: HelmConfig,
}

impl HelmCli {
    /// Create a backend with the given settings
    pub fn new(config: HelmConfig) -> Self {
        Self { config }
    }

    async fn run(&self, release: &str, args: &[&str]) -> Result<String, Error> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args).kill_on_drop(true);
        if let Some(context) = &self.config.kube_context {
            cmd.args(["--kube-context", context.as_str()]);
        }

        let description = format!("helm {}", args.first().copied().unwrap_or_default());
        debug!(release = %release, command = %description, "Running helm");

        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(release = %release, "{} timed out after {:?}", description, self.config.timeout);
                Error::release(
                    release,
                    format!("{description} timed out after {:?}", self.config.timeout),
                )
            })?
            .map_err(|e| Error::release(release, format!("failed to execute helm: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Err(Error::release_not_found(release));
        }
        Err(Error::release(
            release,
            format!("{description} failed: {}", stderr.trim()),
        ))
    }

    async fn apply(
        &self,
        verb: &str,
        name: &str,
        namespace: &str,
        chart: &[u8],
        values: &str,
    ) -> Result<Release, Error> {
        let chart_file = temp_file(name, ".tgz", chart)?;
        let values_file = temp_file(name, ".yaml", values.as_bytes())?;
        let chart_path = path_str(name, chart_file.path())?;
        let values_path = path_str(name, values_file.path())?;

        let stdout = self
            .run(
                name,
                &[
                    verb,
                    name,
                    chart_path,
                    "--namespace",
                    namespace,
                    "--values",
                    values_path,
                    "--output",
                    "json",
                ],
            )
            .await?;

        let release = parse_release(name, &stdout)?;
        info!(release = %name, revision = release.version, "helm {} succeeded", verb);
        Ok(release)
    }
}

#[async_trait]
impl ReleaseBackend for HelmCli {
    async fn list_releases(&self, pattern: &str) -> Result<Vec<Release>, Error> {
        let stdout = self.run(pattern, &list_args(pattern)).await?;
        parse_release_list(pattern, &stdout)
    }

    async fn get_release(&self, name: &str, namespace: &str) -> Result<Option<Release>, Error> {
        let result = self
            .run(
                name,
                &["status", name, "--namespace", namespace, "--output", "json"],
            )
            .await;
        match result {
            Ok(stdout) => parse_release(name, &stdout).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn install_release(
        &self,
        chart: &[u8],
        namespace: &str,
        name: &str,
        values: &str,
    ) -> Result<Release, Error> {
        self.apply("install", name, namespace, chart, values).await
    }

    async fn update_release(
        &self,
        name: &str,
        namespace: &str,
        chart: &[u8],
        values: &str,
    ) -> Result<Release, Error> {
        self.apply("upgrade", name, namespace, chart, values).await
    }

    async fn delete_release(&self, name: &str, namespace: &str, purge: bool) -> Result<(), Error> {
        let mut args = vec!["uninstall", name, "--namespace", namespace];
        if !purge {
            args.push("--keep-history");
        }
        self.run(name, &args).await?;
        info!(release = %name, purge, "helm uninstall succeeded");
        Ok(())
    }
}

/// `--all` so failed and pending releases are listed too; a release stuck
/// in either state still holds its name
fn list_args(pattern: &str) -> [&str; 7] {
    [
        "list",
        "--all",
        "--all-namespaces",
        "--filter",
        pattern,
        "--output",
        "json",
    ]
}

fn is_not_found(stderr: &str) -> bool {
    stderr.to_lowercase().contains("not found")
}

fn temp_file(release: &str, suffix: &str, contents: &[u8]) -> Result<NamedTempFile, Error> {
    let mut file = tempfile::Builder::new()
        .prefix("symphony-")
        .suffix(suffix)
        .tempfile()
        .map_err(|e| Error::release(release, format!("failed to create temp file: {e}")))?;
    file.write_all(contents)
        .and_then(|_| file.flush())
        .map_err(|e| Error::release(release, format!("failed to write temp file: {e}")))?;
    Ok(file)
}

fn path_str<'a>(release: &str, path: &'a Path) -> Result<&'a str, Error> {
    path.to_str()
        .ok_or_else(|| Error::release(release, "temp file path is not valid UTF-8"))
}

/// One entry of `helm list --output json`
#[derive(Deserialize)]
struct ListEntry {
    name: String,
    namespace: String,
    revision: String,
    #[serde(default)]
    chart: Option<String>,
}

/// Output of `helm status|install|upgrade --output json`
#[derive(Deserialize)]
struct ReleaseDocument {
    name: String,
    namespace: String,
    version: i32,
    #[serde(default)]
    chart: Option<ChartDocument>,
}

#[derive(Deserialize)]
struct ChartDocument {
    metadata: ChartMetadata,
}

#[derive(Deserialize)]
struct ChartMetadata {
    name: String,
    #[serde(default)]
    version: String,
}

fn parse_release_list(pattern: &str, stdout: &str) -> Result<Vec<Release>, Error> {
    // helm prints nothing at all when no release matches
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<ListEntry> = serde_json::from_str(stdout)
        .map_err(|e| Error::serialization(format!("helm list output for {pattern}: {e}")))?;

    entries
        .into_iter()
        .map(|entry| {
            let version = entry.revision.parse::<i32>().map_err(|e| {
                Error::serialization(format!(
                    "invalid revision {:?} for release {}: {e}",
                    entry.revision, entry.name
                ))
            })?;
            Ok(Release {
                name: entry.name,
                namespace: entry.namespace,
                version,
                chart: entry.chart,
            })
        })
        .collect()
}

fn parse_release(name: &str, stdout: &str) -> Result<Release, Error> {
    let doc: ReleaseDocument = serde_json::from_str(stdout)
        .map_err(|e| Error::serialization(format!("helm output for release {name}: {e}")))?;
    Ok(Release {
        name: doc.name,
        namespace: doc.namespace,
        version: doc.version,
        chart: doc
            .chart
            .map(|c| format!("{}-{}", c.metadata.name, c.metadata.version)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_OUTPUT: &str = r#"[
        {"name":"demo-blue","namespace":"ns","revision":"3","updated":"2024-01-01 00:00:00 +0000 UTC","status":"deployed","chart":"demo-0.1.0","app_version":"1.0"},
        {"name":"demo-green","namespace":"ns","revision":"1","updated":"2024-01-01 00:00:00 +0000 UTC","status":"deployed","chart":"demo-0.1.0","app_version":"1.0"}
    ]"#;

    const STATUS_OUTPUT: &str = r#"{
        "name":"demo-blue",
        "info":{"status":"deployed","description":"Upgrade complete"},
        "chart":{"metadata":{"name":"demo","version":"0.2.0","apiVersion":"v2"}},
        "config":{"replicaCount":2},
        "version":4,
        "namespace":"ns"
    }"#;

    #[test]
    fn test_parse_release_list() {
        let releases = parse_release_list("^demo-(blue|green)$", LIST_OUTPUT).unwrap();
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].name, "demo-blue");
        assert_eq!(releases[0].version, 3);
        assert_eq!(releases[1].chart.as_deref(), Some("demo-0.1.0"));
    }

    /// Story: a release whose install failed is still seen, so the next pass
    /// upgrades it instead of reinstalling over a taken name
    #[test]
    fn story_failed_and_pending_releases_are_listed() {
        assert!(list_args("^demo-(blue|green)$").contains(&"--all"));

        let out = r#"[
            {"name":"demo-blue","namespace":"ns","revision":"2","status":"failed","chart":"demo-0.1.0"},
            {"name":"demo-green","namespace":"ns","revision":"1","status":"pending-install","chart":"demo-0.1.0"}
        ]"#;
        let releases = parse_release_list("^demo-(blue|green)$", out).unwrap();
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].name, "demo-blue");
        assert_eq!(releases[0].version, 2);
        assert_eq!(releases[1].name, "demo-green");
    }

    #[test]
    fn test_parse_empty_release_list() {
        assert!(parse_release_list("x", "").unwrap().is_empty());
        assert!(parse_release_list("x", "[]\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_list_rejects_bad_revision() {
        let out = r#"[{"name":"a","namespace":"ns","revision":"latest"}]"#;
        let err = parse_release_list("x", out).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_parse_release_document() {
        let release = parse_release("demo-blue", STATUS_OUTPUT).unwrap();
        assert_eq!(
            release,
            Release {
                name: "demo-blue".to_string(),
                namespace: "ns".to_string(),
                version: 4,
                chart: Some("demo-0.2.0".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_release_rejects_garbage() {
        assert!(parse_release("demo-blue", "Error: boom").is_err());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found("Error: release: not found"));
        assert!(is_not_found(
            "Error: uninstall: Release not loaded: demo-blue: release: not found"
        ));
        assert!(!is_not_found("Error: Kubernetes cluster unreachable"));
    }

    #[test]
    fn test_temp_file_holds_contents() {
        let file = temp_file("demo-blue", ".yaml", b"replicaCount: 2").unwrap();
        assert!(file.path().to_string_lossy().ends_with(".yaml"));
        assert_eq!(
            std::fs::read_to_string(file.path()).unwrap(),
            "replicaCount: 2"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_release_error() {
        let helm = HelmCli::new(HelmConfig {
            binary: PathBuf::from("/nonexistent/helm"),
            ..Default::default()
        });
        let err = helm.list_releases("^demo-(blue|green)$").await.unwrap_err();
        assert!(matches!(err, Error::Release { .. }));
        assert!(!err.is_not_found());
    }
}
