use forge_core::{ForgeError, ForgeResult};
use regex::Regex;

/// Maximum length of sandbox output returned to callers.
pub const MAX_OUTPUT_CHARS: usize = 10_000;
const TRUNCATION_MARKER: &str = "\n... (output truncated)";

/// Input sanitizer applied to raw participant output before it is parsed.
pub struct Sanitizer {
    max_message_length: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            max_message_length: 200_000,
        }
    }
}

impl Sanitizer {
    pub fn new(max_message_length: usize) -> Self {
        Self { max_message_length }
    }

    /// Strip control characters and enforce the length limit.
    pub fn sanitize(&self, input: &str) -> SanitizeResult {
        if input.len() > self.max_message_length {
            return SanitizeResult::Rejected(format!(
                "Input exceeds maximum length of {} bytes",
                self.max_message_length
            ));
        }

        let cleaned: String = input
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
            .collect();

        if cleaned.is_empty() && !input.is_empty() {
            return SanitizeResult::Rejected("Input contains only control characters".to_string());
        }

        if cleaned != input {
            SanitizeResult::Cleaned(cleaned)
        } else {
            SanitizeResult::Clean(cleaned)
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum SanitizeResult {
    /// Input was already clean.
    Clean(String),
    /// Input was cleaned (control characters removed).
    Cleaned(String),
    /// Input was rejected entirely.
    Rejected(String),
}

impl SanitizeResult {
    pub fn is_rejected(&self) -> bool {
        matches!(self, SanitizeResult::Rejected(_))
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            SanitizeResult::Clean(s) | SanitizeResult::Cleaned(s) => Some(s),
            SanitizeResult::Rejected(_) => None,
        }
    }
}

/// Redacts host details from sandbox output and caps its length.
///
/// URLs are replaced first so their paths are not mangled into `[PATH]`.
pub struct OutputRedactor {
    url: Regex,
    ip: Regex,
    path: Regex,
    max_chars: usize,
}

impl OutputRedactor {
    pub fn new() -> ForgeResult<Self> {
        Self::with_limit(MAX_OUTPUT_CHARS)
    }

    pub fn with_limit(max_chars: usize) -> ForgeResult<Self> {
        let re = |p: &str| Regex::new(p).map_err(|e| ForgeError::Security(e.to_string()));
        Ok(Self {
            url: re(r"https?://[^\s]+")?,
            ip: re(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b")?,
            // A path must start the output or follow a non-word character,
            // so arithmetic like `10/2` is left alone.
            path: re(r"(^|[^\w/])((?:/[a-zA-Z0-9_\-.]+)+/?)")?,
            max_chars,
        })
    }

    pub fn redact(&self, output: &str) -> String {
        let out = self.url.replace_all(output, "[URL]");
        let out = self.ip.replace_all(&out, "[IP]");
        let out = self.path.replace_all(&out, "${1}[PATH]");

        if out.chars().count() > self.max_chars {
            let mut truncated: String = out.chars().take(self.max_chars).collect();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        } else {
            out.into_owned()
        }
    }
}
