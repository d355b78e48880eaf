use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Leading block tokens that wrap policy content without being policies
/// themselves. Their bodies are scanned, but no artifact is emitted.
const WRAPPER_KEYWORDS: [&str; 5] = ["configuration", "param", "parameter", "import", "node"];

static BLOCK_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)[ \t]*(?:"([^"]*)"|([A-Za-z_$][A-Za-z0-9_]*))?\s*\{"#)
        .expect("static block pattern")
});

static SETTING_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*=\s*"([^"]*)""#)
        .expect("static assignment pattern")
});

/// One discrete policy setting block extracted from the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyArtifact {
    pub name: String,
    pub description: String,
    pub settings: BTreeMap<String, String>,
}

/// How the corpus source should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusMode {
    /// Keep the source text verbatim; no artifact extraction.
    Raw,
    /// Extract brace-delimited blocks into [`PolicyArtifact`]s.
    Structured,
}

/// The policy evidence for one assessment run. Loaded once, shared
/// read-only by every classification in that run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyCorpus {
    raw: String,
    artifacts: Vec<PolicyArtifact>,
}

impl PolicyCorpus {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Opaque blob, used verbatim as grounding context.
    pub fn from_raw(text: impl Into<String>) -> Self {
        Self {
            raw: text.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn from_artifacts(artifacts: Vec<PolicyArtifact>) -> Self {
        Self {
            raw: String::new(),
            artifacts,
        }
    }

    /// Extract structured artifacts from blob text, keeping the raw text too.
    pub fn parse(text: impl Into<String>) -> Self {
        let raw = text.into();
        let artifacts = extract_artifacts(&raw);
        debug!(artifacts = artifacts.len(), "corpus parsed");
        Self { raw, artifacts }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty() && self.artifacts.is_empty()
    }

    pub fn raw_text(&self) -> &str {
        &self.raw
    }

    pub fn artifacts(&self) -> &[PolicyArtifact] {
        &self.artifacts
    }

    /// Textual rendering used as grounding context: the structured artifacts
    /// when present, otherwise the raw blob.
    pub fn render(&self) -> String {
        if self.artifacts.is_empty() {
            return self.raw.clone();
        }
        let mut out = String::new();
        for artifact in &self.artifacts {
            let _ = writeln!(out, "Policy: {}", artifact.name);
            if !artifact.description.is_empty() {
                let _ = writeln!(out, "Description: {}", artifact.description);
            }
            for (key, value) in &artifact.settings {
                let _ = writeln!(out, "  {key} = {value}");
            }
            out.push('\n');
        }
        out
    }
}

/// Failure to read or decode a corpus source.
#[derive(Debug, Error)]
pub enum CorpusLoadError {
    #[error("failed to read policy corpus at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("policy corpus at {path} is not valid UTF-8 or UTF-16 text")]
    Encoding { path: PathBuf },
}

/// Load a corpus from disk. UTF-16 sources (BOM-marked, the usual DSC export
/// encoding) are decoded transparently; everything else must be UTF-8.
pub fn load(path: &Path, mode: CorpusMode) -> Result<PolicyCorpus, CorpusLoadError> {
    let bytes = std::fs::read(path).map_err(|source| CorpusLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let text = decode_text(&bytes).ok_or_else(|| CorpusLoadError::Encoding {
        path: path.to_path_buf(),
    })?;
    Ok(match mode {
        CorpusMode::Raw => PolicyCorpus::from_raw(text),
        CorpusMode::Structured => PolicyCorpus::parse(text),
    })
}

fn decode_text(bytes: &[u8]) -> Option<String> {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
        _ => String::from_utf8(bytes.to_vec()).ok(),
    }
}

fn decode_utf16(bytes: &[u8], combine: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| combine([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Walk the text for `Ident ["Label"] {` headers, skipping wrapper blocks and
/// emitting an artifact per remaining depth-matched block.
fn extract_artifacts(text: &str) -> Vec<PolicyArtifact> {
    let mut artifacts = Vec::new();
    let mut pos = 0;
    while let Some(caps) = BLOCK_HEADER.captures(&text[pos..]) {
        let header = caps.get(0).expect("whole match");
        let keyword = caps.get(1).expect("block keyword").as_str();
        let label = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string());
        let open = pos + header.end() - 1;

        if WRAPPER_KEYWORDS.contains(&keyword.to_lowercase().as_str()) {
            // descend into the wrapper body
            pos = open + 1;
            continue;
        }

        let close = matching_brace(text, open).unwrap_or(text.len());
        let body = &text[open + 1..close.min(text.len())];
        let settings: BTreeMap<String, String> = SETTING_ASSIGNMENT
            .captures_iter(body)
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
            .collect();
        let description = settings.get("Description").cloned().unwrap_or_default();
        artifacts.push(PolicyArtifact {
            name: label.unwrap_or_else(|| keyword.to_string()),
            description,
            settings,
        });
        pos = close.saturating_add(1).min(text.len());
        if pos >= text.len() {
            break;
        }
    }
    artifacts
}

/// Index of the brace closing the one at `open`, by depth counting.
/// Braces inside double-quoted values do not count toward depth.
fn matching_brace(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    for (offset, ch) in text[open..].char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
Configuration EntraExport {
    param (
        $Credential
    )

    AADConditionalAccessPolicy "RequireMfaForAdmins" {
        Description = "Require multifactor authentication for admin roles"
        State       = "enabled"
        GrantControls = "mfa"
    }

    AADPasswordPolicy "PasswordPolicy" {
        MinimumLength = "14"
    }
}
"#;

    #[test]
    fn structured_parse_extracts_artifacts_and_skips_wrappers() {
        let corpus = PolicyCorpus::parse(SAMPLE);
        let names: Vec<_> = corpus.artifacts().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["RequireMfaForAdmins", "PasswordPolicy"]);

        let mfa = &corpus.artifacts()[0];
        assert_eq!(
            mfa.description,
            "Require multifactor authentication for admin roles"
        );
        assert_eq!(mfa.settings.get("State").map(String::as_str), Some("enabled"));

        let pw = &corpus.artifacts()[1];
        assert!(pw.description.is_empty());
        assert_eq!(
            pw.settings.get("MinimumLength").map(String::as_str),
            Some("14")
        );
    }

    #[test]
    fn unlabeled_block_uses_keyword_as_name() {
        let corpus = PolicyCorpus::parse(r#"ExchangeTransportRule { Mode = "Enforce" }"#);
        assert_eq!(corpus.artifacts().len(), 1);
        assert_eq!(corpus.artifacts()[0].name, "ExchangeTransportRule");
    }

    #[test]
    fn braces_inside_quoted_values_do_not_end_the_block() {
        let corpus = PolicyCorpus::parse(
            "AADPasswordPolicy \"PasswordPolicy\" {\n    Exclusion     = \"allow}\"\n    MinimumLength = \"14\"\n}\n",
        );
        assert_eq!(corpus.artifacts().len(), 1);
        let settings = &corpus.artifacts()[0].settings;
        assert_eq!(settings.get("Exclusion").map(String::as_str), Some("allow}"));
        assert_eq!(settings.get("MinimumLength").map(String::as_str), Some("14"));
    }

    #[test]
    fn raw_mode_keeps_text_verbatim_without_artifacts() {
        let corpus = PolicyCorpus::from_raw(SAMPLE);
        assert_eq!(corpus.raw_text(), SAMPLE);
        assert!(corpus.artifacts().is_empty());
        assert!(!corpus.is_empty());
    }

    #[test]
    fn empty_corpus_is_empty() {
        assert!(PolicyCorpus::empty().is_empty());
        assert!(PolicyCorpus::from_raw("   \n").is_empty());
    }

    #[test]
    fn render_lists_artifacts_with_settings() {
        let corpus = PolicyCorpus::parse(SAMPLE);
        let rendered = corpus.render();
        assert!(rendered.contains("Policy: RequireMfaForAdmins"));
        assert!(rendered.contains("MinimumLength = 14"));
    }

    #[test]
    fn loads_utf16_le_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let text = "AADPasswordPolicy \"PasswordPolicy\" { MinimumLength = \"14\" }";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        file.write_all(&bytes).unwrap();

        let corpus = load(file.path(), CorpusMode::Structured).unwrap();
        assert_eq!(corpus.artifacts().len(), 1);
        assert_eq!(corpus.artifacts()[0].name, "PasswordPolicy");
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = load(Path::new("/nonexistent/policies.txt"), CorpusMode::Raw).unwrap_err();
        assert!(matches!(err, CorpusLoadError::Io { .. }));
    }

    #[test]
    fn undecodable_bytes_are_an_encoding_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xFF, 0xFE, 0x00]).unwrap();
        let err = load(file.path(), CorpusMode::Raw).unwrap_err();
        assert!(matches!(err, CorpusLoadError::Encoding { .. }));
    }
}
