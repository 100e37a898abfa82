//! # Configuration Parser
//!
//! Static processing of the Terraform configuration files in a working
//! directory, run as part of every init:
//!
//! - **Secret rewriting** - placeholder tokens of the form
//!   `<path:{project}/data/{path}#{key}[#{version}]>` are resolved against
//!   the secret store and replaced with quoted literals. Tokens referencing
//!   a project other than the stack's own are rejected and left unchanged.
//! - **Backend verification** - exactly one file must declare
//!   `terraform { backend "consul" {} }` with an empty body; the wiring
//!   (address/scheme/path) is injected at init time, never committed.

use crate::secrets::SecretStore;
use anyhow::Context;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// The only backend kind this control plane accepts.
pub const BACKEND_KIND: &str = "consul";

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"<path:(?P<project>[^#>\s]+?)/data/(?P<path>[^#>\s]+)#(?P<key>[^#>\s]+?)(?:#(?P<version>\d+))?>",
    )
    .expect("secret token regex is valid")
});

static TERRAFORM_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bterraform\s*\{").expect("terraform block regex is valid"));

static BACKEND_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bbackend\s+"(?P<kind>[^"]+)"\s*\{"#).expect("backend block regex is valid")
});

/// Fatal configuration errors. These abort the cycle before any terraform
/// process is started and are never retried within the cycle.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("secret rewriting failed: {}", .0.join("; "))]
    Rewrite(Vec<String>),
    #[error("no configuration file declares a terraform backend")]
    BackendMissing,
    #[error("backend kind must be \"{BACKEND_KIND}\", found \"{kind}\" in {file}")]
    BackendWrongKind { kind: String, file: String },
    #[error("backend block in {file} must be empty; backend wiring is injected at init time")]
    BackendNotEmpty { file: String },
    #[error("backend declared in more than one file: {first} and {second}")]
    BackendDuplicate { first: String, second: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// One parsed secret placeholder token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretToken {
    pub project: String,
    pub path: String,
    pub key: String,
    pub version: Option<u64>,
}

fn parse_token(caps: &regex::Captures<'_>) -> SecretToken {
    SecretToken {
        project: caps["project"].to_string(),
        path: caps["path"].to_string(),
        key: caps["key"].to_string(),
        version: caps.name("version").and_then(|v| v.as_str().parse().ok()),
    }
}

/// Configuration files in the working directory, sorted for determinism.
fn config_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("tf") | Some("tfvars")
            )
        })
        .collect();
    files.sort();
    files
}

fn quote_literal(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Rewrite secret placeholder tokens across every configuration file.
///
/// All files are processed even when some fail; files whose tokens resolved
/// are written back in place, and the collected failures are returned
/// together. Tokens referencing a foreign project are an error and remain
/// textually unchanged.
pub async fn rewrite_secrets(
    dir: &Path,
    stack_project: &str,
    store: &dyn SecretStore,
) -> Result<usize, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut substituted = 0usize;

    for file in config_files(dir) {
        let display = file.display().to_string();
        let content = match std::fs::read_to_string(&file)
            .context(format!("Failed to read configuration file {display}"))
        {
            Ok(c) => c,
            Err(e) => {
                errors.push(format!("{e:#}"));
                continue;
            }
        };

        let mut rewritten = content.clone();
        for caps in TOKEN_RE.captures_iter(&content) {
            let raw = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let token = parse_token(&caps);

            if token.project != stack_project {
                errors.push(format!(
                    "{display}: token {raw} references project {} (stack project is {stack_project})",
                    token.project
                ));
                continue;
            }

            let values = match store
                .get_secret_with_version(&token.project, &token.path, token.version)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    errors.push(format!("{display}: {raw}: {e:#}"));
                    continue;
                }
            };

            match values.get(&token.key) {
                Some(value) => {
                    rewritten = rewritten.replace(raw, &quote_literal(value));
                    substituted += 1;
                }
                None => {
                    errors.push(format!(
                        "{display}: secret {}/{} has no key {}",
                        token.project, token.path, token.key
                    ));
                }
            }
        }

        if rewritten != content {
            if let Err(e) = std::fs::write(&file, rewritten)
                .context(format!("Failed to write configuration file {display}"))
            {
                errors.push(format!("{e:#}"));
            } else {
                let rewritten_path = display.as_str();
                debug!("Rewrote secret tokens in {}", rewritten_path);
            }
        }
    }

    if errors.is_empty() {
        Ok(substituted)
    } else {
        Err(ConfigError::Rewrite(errors))
    }
}

/// Verify the mandatory remote-state backend declaration.
///
/// Exactly one configuration file must carry a `terraform { backend "consul"
/// {} }` block with an empty body. Returns the declaring file.
pub fn check_backend(dir: &Path) -> Result<PathBuf, ConfigError> {
    let mut declaring: Option<(PathBuf, String, String)> = None;

    for file in config_files(dir) {
        let display = file.display().to_string();
        let content = std::fs::read_to_string(&file)
            .context(format!("Failed to read configuration file {display}"))?;
        let stripped = strip_comments(&content);

        for terraform_body in blocks(&stripped, &TERRAFORM_BLOCK_RE) {
            if let Some(caps) = BACKEND_BLOCK_RE.captures(&terraform_body) {
                let kind = caps["kind"].to_string();
                let open = caps.get(0).map_or(0, |m| m.end());
                let body = block_body(&terraform_body, open - 1).unwrap_or_default();

                if let Some((first, _, _)) = &declaring {
                    return Err(ConfigError::BackendDuplicate {
                        first: first.display().to_string(),
                        second: display,
                    });
                }
                declaring = Some((file.clone(), kind, body));
            }
        }
    }

    match declaring {
        None => Err(ConfigError::BackendMissing),
        Some((file, kind, body)) => {
            if kind != BACKEND_KIND {
                return Err(ConfigError::BackendWrongKind {
                    kind,
                    file: file.display().to_string(),
                });
            }
            if !body.trim().is_empty() {
                return Err(ConfigError::BackendNotEmpty {
                    file: file.display().to_string(),
                });
            }
            Ok(file)
        }
    }
}

/// Drop `#` and `//` line comments so commented-out declarations don't count.
fn strip_comments(content: &str) -> String {
    content
        .lines()
        .map(|line| {
            let cut = line
                .find('#')
                .into_iter()
                .chain(line.find("//"))
                .min()
                .unwrap_or(line.len());
            &line[..cut]
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Bodies of every block whose opener matches `re` (brace-balanced).
fn blocks(content: &str, re: &Regex) -> Vec<String> {
    let mut out = Vec::new();
    for m in re.find_iter(content) {
        // The match ends just past the opening brace.
        if let Some(body) = block_body(content, m.end() - 1) {
            out.push(body);
        }
    }
    out
}

/// The text between the brace at `open` and its balancing close brace.
fn block_body(content: &str, open: usize) -> Option<String> {
    let bytes = content.as_bytes();
    if bytes.get(open) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    for (i, b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(content[open + 1..i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
