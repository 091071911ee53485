//! Detection of blocking interactive prompts in child output.
//!
//! Prompts usually lack a trailing newline, so the supervisor feeds both
//! complete lines and the pending partial line through the detector.

use regex::Regex;

/// Signatures of prompts that would block a non-interactive build forever.
pub const DEFAULT_PROMPT_SIGNATURES: &[&str] = &[
    r"(?i)\[sudo\] password for",
    r"(?i)^\s*password\s*:\s*$",
    r"(?i)password for \S+\s*:\s*$",
    r"(?i)enter (the )?pass(word|phrase)",
    r"(?i)sudo: a (terminal|password) is required",
    r"(?i)are you sure you want to continue connecting",
    r"(?i)do you want to continue\? \[y/n\]",
    r"(?i)^username for '[^']*':\s*$",
];

/// A compiled set of prompt signatures.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    signatures: Vec<Regex>,
}

impl Default for PromptDetector {
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_SIGNATURES).expect("built-in prompt signatures are valid")
    }
}

impl PromptDetector {
    /// Compiles the given signatures.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let signatures = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { signatures })
    }

    /// Returns the first signature matching `text`, as its source pattern.
    #[must_use]
    pub fn detect(&self, text: &str) -> Option<&str> {
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            return None;
        }
        self.signatures
            .iter()
            .find(|re| re.is_match(text))
            .map(Regex::as_str)
    }

    /// Returns the number of signatures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Returns true if no signatures are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_signatures_compile() {
        let detector = PromptDetector::default();
        assert_eq!(detector.len(), DEFAULT_PROMPT_SIGNATURES.len());
    }

    #[test]
    fn test_detects_common_prompts() {
        let detector = PromptDetector::default();
        for prompt in [
            "[sudo] password for lfs: ",
            "Password:",
            "Enter passphrase for key '/root/.ssh/id_rsa': ",
            "sudo: a terminal is required to read the password",
            "Are you sure you want to continue connecting (yes/no)? ",
            "Do you want to continue? [Y/n] ",
            "Username for 'https://github.com': ",
        ] {
            assert!(detector.detect(prompt).is_some(), "missed prompt: {prompt}");
        }
    }

    #[test]
    fn test_ignores_ordinary_output() {
        let detector = PromptDetector::default();
        for line in [
            "checking for gcc... gcc",
            "make[2]: Entering directory '/mnt/lfs/sources/binutils'",
            "password file updated",
            "",
        ] {
            assert!(detector.detect(line).is_none(), "false positive: {line}");
        }
    }

    #[test]
    fn test_custom_signatures() {
        let detector = PromptDetector::new(&["(?i)press any key"]).unwrap();
        assert_eq!(detector.detect("Press any key to continue"), Some("(?i)press any key"));
        assert!(PromptDetector::new(&["("]).is_err());
    }
}
