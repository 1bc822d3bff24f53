use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

const DEFAULT_MARKER: char = '*';
const LISTING_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    pub name: String,
    pub running: bool,
    pub api_version: u32,
    pub is_default: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("no Linux environments found in bridge listing")]
    NoEnvironmentsFound,
    #[error("failed listing Linux environments: {0}")]
    Listing(String),
}

/// Raw bytes of an environment listing, e.g. the output of `wsl -l -v`.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_listing(&self) -> Result<Vec<u8>>;
}

/// Lists environments by running the bridge binary directly.
#[derive(Debug, Clone)]
pub struct BridgeListing {
    program: String,
    args: Vec<String>,
}

impl BridgeListing {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec!["-l".to_owned(), "-v".to_owned()],
        }
    }
}

#[async_trait]
impl ListingSource for BridgeListing {
    async fn fetch_listing(&self) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        let output = tokio::time::timeout(LISTING_TIMEOUT, cmd.output())
            .await
            .map_err(|_| anyhow!("`{} {}` timed out", self.program, self.args.join(" ")))?
            .with_context(|| format!("failed running `{}`", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "`{} {}` exited with {}: {}",
                self.program,
                self.args.join(" "),
                output.status,
                sanitize_line(stderr.as_bytes())
            ));
        }
        Ok(output.stdout)
    }
}

#[derive(Clone)]
pub struct DistributionDetector {
    source: Arc<dyn ListingSource>,
}

impl DistributionDetector {
    pub fn new(source: Arc<dyn ListingSource>) -> Self {
        Self { source }
    }

    /// Listing as printable text, with noise bytes removed.
    pub async fn raw_listing(&self) -> Result<String, DetectError> {
        let bytes = self
            .source
            .fetch_listing()
            .await
            .map_err(|err| DetectError::Listing(format!("{err:#}")))?;
        Ok(split_clean_lines(&bytes).join("\n"))
    }

    pub async fn list_environments(&self) -> Result<Vec<EnvironmentInfo>, DetectError> {
        let bytes = self
            .source
            .fetch_listing()
            .await
            .map_err(|err| DetectError::Listing(format!("{err:#}")))?;
        let environments = parse_listing(&bytes);
        debug!(count = environments.len(), "parsed environment listing");
        Ok(environments)
    }

    pub async fn detect_default(&self) -> Result<String, DetectError> {
        let environments = match self.list_environments().await {
            Ok(environments) => environments,
            Err(err) => {
                warn!("environment detection failed: {err}");
                return Err(err);
            }
        };
        let name = pick_default(&environments).ok_or(DetectError::NoEnvironmentsFound)?;
        info!("auto-detected Linux environment: {name}");
        Ok(name)
    }
}

pub fn pick_default(environments: &[EnvironmentInfo]) -> Option<String> {
    environments
        .iter()
        .find(|env| env.is_default)
        .or_else(|| environments.first())
        .map(|env| env.name.clone())
}

/// Parses a `wsl -l -v` (or `wsl -l`) listing into environment records.
///
/// The listing is usually UTF-16LE with a BOM and CRLF line endings. Every
/// byte outside printable ASCII is dropped, which collapses UTF-16 text of
/// ASCII names into plain ASCII. Header, banner and separator lines are
/// skipped.
pub fn parse_listing(raw: &[u8]) -> Vec<EnvironmentInfo> {
    split_clean_lines(raw)
        .iter()
        .filter_map(|line| parse_listing_line(line))
        .collect()
}

fn split_clean_lines(raw: &[u8]) -> Vec<String> {
    raw.split(|byte| *byte == b'\n')
        .map(sanitize_line)
        .filter(|line| !line.is_empty())
        .collect()
}

fn sanitize_line(raw: &[u8]) -> String {
    let text = raw
        .iter()
        .filter_map(|byte| match byte {
            b'\t' => Some(' '),
            0x20..=0x7e => Some(*byte as char),
            _ => None,
        })
        .collect::<String>();
    text.trim().to_owned()
}

fn is_noise_line(line: &str) -> bool {
    let lowered = line.to_ascii_lowercase();
    if lowered.contains("windows subsystem for linux")
        || lowered.starts_with("the following")
        || lowered.contains("distributions")
    {
        return true;
    }
    if line.chars().all(|ch| matches!(ch, '-' | '=' | ' ')) {
        return true;
    }
    let mut tokens = line.split_whitespace();
    tokens.next() == Some("NAME") && tokens.next() == Some("STATE")
}

fn parse_listing_line(line: &str) -> Option<EnvironmentInfo> {
    if is_noise_line(line) {
        return None;
    }

    let (is_marked, rest) = match line.strip_prefix(DEFAULT_MARKER) {
        Some(rest) => (true, rest.trim_start()),
        None => (false, line),
    };
    let mut tokens = rest.split_whitespace();
    let name = tokens.next()?;
    if name.len() < 2 {
        return None;
    }

    let mut running = false;
    let mut api_version = 0;
    let mut short_default = false;
    for token in tokens {
        match token.to_ascii_lowercase().as_str() {
            "running" => running = true,
            "(default)" => short_default = true,
            other => {
                if let Ok(version) = other.parse::<u32>() {
                    api_version = version;
                }
            }
        }
    }

    Some(EnvironmentInfo {
        name: name.to_owned(),
        running,
        api_version,
        is_default: is_marked || short_default,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct StaticListing(pub Vec<u8>);

    #[async_trait]
    impl ListingSource for StaticListing {
        async fn fetch_listing(&self) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    pub(crate) struct FailingListing;

    #[async_trait]
    impl ListingSource for FailingListing {
        async fn fetch_listing(&self) -> Result<Vec<u8>> {
            Err(anyhow!("bridge binary not found"))
        }
    }

    fn utf16le(text: &str) -> Vec<u8> {
        let mut out = vec![0xff, 0xfe];
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    const VERBOSE_LISTING: &str = "  NAME            STATE           VERSION\r\n  Debian          Stopped         2\r\n* Ubuntu-22.04    Running         2\r\n  Alpine          Stopped         1\r\n";

    #[test]
    fn parses_verbose_listing_with_default_marker() {
        let envs = parse_listing(VERBOSE_LISTING.as_bytes());
        assert_eq!(envs.len(), 3);
        assert_eq!(
            envs[1],
            EnvironmentInfo {
                name: "Ubuntu-22.04".to_owned(),
                running: true,
                api_version: 2,
                is_default: true,
            }
        );
        assert!(!envs[0].running);
        assert_eq!(envs[2].api_version, 1);
        assert_eq!(pick_default(&envs).as_deref(), Some("Ubuntu-22.04"));
    }

    #[test]
    fn strips_utf16_nul_bytes_and_control_characters() {
        let envs = parse_listing(&utf16le(VERBOSE_LISTING));
        let names = envs.iter().map(|env| env.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Debian", "Ubuntu-22.04", "Alpine"]);
        assert!(envs[1].is_default);
    }

    #[test]
    fn parses_short_listing_with_default_suffix() {
        let listing = "Windows Subsystem for Linux Distributions:\r\nUbuntu (Default)\r\nkali-linux\r\n";
        let envs = parse_listing(listing.as_bytes());
        assert_eq!(envs.len(), 2);
        assert!(envs[0].is_default);
        assert_eq!(envs[0].name, "Ubuntu");
        assert!(!envs[1].is_default);
    }

    #[test]
    fn tolerates_tabs_separators_and_blank_lines() {
        let listing = "\n\n  NAME\tSTATE\tVERSION\n-----------\n*\tArch\tRunning\t2\n\n";
        let envs = parse_listing(listing.as_bytes());
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].name, "Arch");
        assert!(envs[0].is_default);
        assert!(envs[0].running);
    }

    #[test]
    fn falls_back_to_first_entry_without_marker() {
        let envs = parse_listing(b"Debian Stopped 2\nFedora Running 2\n");
        assert_eq!(pick_default(&envs).as_deref(), Some("Debian"));
    }

    #[tokio::test]
    async fn detect_default_returns_marked_entry() {
        let detector =
            DistributionDetector::new(Arc::new(StaticListing(VERBOSE_LISTING.as_bytes().to_vec())));
        assert_eq!(
            detector.detect_default().await.expect("default"),
            "Ubuntu-22.04"
        );
    }

    #[tokio::test]
    async fn detect_default_fails_on_empty_or_header_only_listing() {
        for listing in [&b""[..], b"  NAME  STATE  VERSION\r\n", b"\x00\x01\x02"] {
            let detector = DistributionDetector::new(Arc::new(StaticListing(listing.to_vec())));
            let err = detector.detect_default().await.expect_err("no environments");
            assert!(matches!(err, DetectError::NoEnvironmentsFound));
        }
    }

    #[tokio::test]
    async fn detect_default_surfaces_listing_failures() {
        let detector = DistributionDetector::new(Arc::new(FailingListing));
        let err = detector.detect_default().await.expect_err("listing fails");
        assert!(matches!(err, DetectError::Listing(_)));
    }
}
