//! Static scanning of generated Python code before it is allowed to run.
//!
//! The scan is lexical: a syntax sanity check, import and call denylists,
//! hardcoded-secret patterns, and network-usage warnings. It never executes
//! or imports the code.

use forge_core::{ForgeError, ForgeResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Modules whose import is a violation.
const DANGEROUS_MODULES: &[&str] = &[
    "os",
    "subprocess",
    "sys",
    "importlib",
    "builtins",
    "ctypes",
    "shutil",
    "pty",
    "signal",
    "multiprocessing",
    "pickle",
    "marshal",
];

const DANGEROUS_CALLS: &[(&str, &str)] = &[
    (r"\beval\s*\(", "Use of eval() detected"),
    (r"\bexec\s*\(", "Use of exec() detected"),
    (r"\b__import__\s*\(", "Dynamic import via __import__() detected"),
    (r"\bsubprocess\.", "Subprocess usage detected"),
    (r"\bos\.system\b", "OS command execution via os.system detected"),
    (r"\bopen\s*\(", "File operation via open() detected"),
    (r"\bcompile\s*\(", "Dynamic code compilation via compile() detected"),
    (r"\bglobals\s*\(\s*\)", "Global scope access via globals() detected"),
    (r"\blocals\s*\(\s*\)", "Local scope access via locals() detected"),
    (r"\bvars\s*\(", "Scope access via vars() detected"),
    (r"\b(?:getattr|setattr|delattr)\s*\(", "Reflective attribute access detected"),
    (r"\bload_module\s*\(", "Module loading via load_module() detected"),
];

/// Dunder attributes that walk the object graph towards builtins, frames or
/// loaders. Each distinct one found is its own violation.
const INTROSPECTION_ATTRS: &[&str] = &[
    "class",
    "base",
    "bases",
    "mro",
    "subclasses",
    "globals",
    "builtins",
    "code",
    "closure",
    "dict",
];

const SECRET_PATTERNS: &[(&str, &str)] = &[
    (
        r#"(?i)(api[_-]?key|apikey)\s*[:=]\s*['"][^'"]+['"]"#,
        "Hardcoded API key detected",
    ),
    (
        r#"(?i)(password|passwd|pwd)\s*[:=]\s*['"][^'"]+['"]"#,
        "Hardcoded password detected",
    ),
    (
        r#"(?i)(secret|token)\s*[:=]\s*['"][^'"]+['"]"#,
        "Hardcoded secret detected",
    ),
    (
        r"(?i)(aws[_-]?access[_-]?key[_-]?id)\s*[:=]",
        "AWS credentials detected",
    ),
    (
        r"(?i)(aws[_-]?secret[_-]?access[_-]?key)\s*[:=]",
        "AWS secret key detected",
    ),
];

const NETWORK_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)urllib|requests|http\.client|socket", "Network operation detected"),
    (r"(?i)urlopen|urlretrieve", "URL access detected"),
    (r"\b__\w+__\b", "Dunder name usage detected"),
];

/// Words whose presence in a violation makes the scan high risk.
const HIGH_RISK_MARKERS: &[&str] = &["eval", "exec", "subprocess", "system"];

const BLOCK_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "def", "class", "try", "except", "finally", "with",
];

/// Severity of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        })
    }
}

/// Outcome of [`CodeSecurityScanner::scan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityScanResult {
    pub safe: bool,
    pub risk_level: RiskLevel,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(with = "duration_ms")]
    pub scan_time: Duration,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Lexical security scanner for Python source.
pub struct CodeSecurityScanner {
    import_re: Regex,
    from_import_re: Regex,
    introspection_re: Regex,
    calls: Vec<(Regex, &'static str)>,
    secrets: Vec<(Regex, &'static str)>,
    network: Vec<(Regex, &'static str)>,
}

fn compile(table: &[(&str, &'static str)]) -> ForgeResult<Vec<(Regex, &'static str)>> {
    table
        .iter()
        .map(|(pattern, message)| {
            Regex::new(pattern)
                .map(|re| (re, *message))
                .map_err(|e| ForgeError::Security(format!("bad scanner pattern {pattern}: {e}")))
        })
        .collect()
}

impl CodeSecurityScanner {
    pub fn new() -> ForgeResult<Self> {
        let re = |p: &str| Regex::new(p).map_err(|e| ForgeError::Security(e.to_string()));
        Ok(Self {
            import_re: re(r"(?m)^[ \t]*import[ \t]+([\w.,\t ]+)")?,
            from_import_re: re(r"(?m)^[ \t]*from[ \t]+([\w.]+)[ \t]+import\b")?,
            introspection_re: re(&format!(
                r"\b__({})__\b",
                INTROSPECTION_ATTRS.join("|")
            ))?,
            calls: compile(DANGEROUS_CALLS)?,
            secrets: compile(SECRET_PATTERNS)?,
            network: compile(NETWORK_PATTERNS)?,
        })
    }

    /// Scans `code` and classifies its risk.
    pub fn scan(&self, code: &str) -> SecurityScanResult {
        let started = Instant::now();
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        if let Err(e) = check_syntax(code) {
            violations.push(format!("Syntax error: {e}"));
            return SecurityScanResult {
                safe: false,
                risk_level: RiskLevel::High,
                violations,
                warnings,
                scan_time: started.elapsed(),
            };
        }

        violations.extend(self.dangerous_imports(code));

        let mut introspected: Vec<&str> = Vec::new();
        for cap in self.introspection_re.captures_iter(code) {
            if let Some(name) = cap.get(1).map(|m| m.as_str()) {
                if !introspected.contains(&name) {
                    introspected.push(name);
                }
            }
        }
        violations.extend(
            introspected
                .iter()
                .map(|name| format!("Object introspection via __{name}__ detected")),
        );

        for (re, message) in self.calls.iter().chain(&self.secrets) {
            if re.is_match(code) {
                violations.push((*message).to_string());
            }
        }

        for (re, message) in &self.network {
            if re.is_match(code) {
                warnings.push((*message).to_string());
            }
        }

        let risk_level = classify(&violations);
        SecurityScanResult {
            safe: risk_level == RiskLevel::Low && violations.is_empty(),
            risk_level,
            violations,
            warnings,
            scan_time: started.elapsed(),
        }
    }

    fn dangerous_imports(&self, code: &str) -> Vec<String> {
        let mut found = Vec::new();
        let is_dangerous = |module: &str| {
            let root = module.split('.').next().unwrap_or(module);
            DANGEROUS_MODULES.contains(&root)
        };

        for cap in self.import_re.captures_iter(code) {
            for item in cap[1].split(',') {
                let module = item.split_whitespace().next().unwrap_or("");
                if !module.is_empty() && is_dangerous(module) {
                    found.push(format!("Dangerous import: {module}"));
                }
            }
        }
        for cap in self.from_import_re.captures_iter(code) {
            let module = &cap[1];
            if is_dangerous(module) {
                found.push(format!("Dangerous import from: {module}"));
            }
        }
        found
    }
}

fn classify(violations: &[String]) -> RiskLevel {
    if violations.is_empty() {
        return RiskLevel::Low;
    }
    let mentions_high_risk = violations.iter().any(|v| {
        let lower = v.to_lowercase();
        HIGH_RISK_MARKERS.iter().any(|m| lower.contains(m))
    });
    if mentions_high_risk || violations.len() > 3 {
        RiskLevel::High
    } else {
        RiskLevel::Medium
    }
}

/// Lightweight syntax sanity check: balanced brackets, terminated strings, and
/// a `:` on every block header at bracket depth zero.
pub fn check_syntax(code: &str) -> Result<(), String> {
    let chars: Vec<char> = code.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut logical = String::new();
    let mut logical_start = 1usize;
    let mut header_colon = false;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '\'' | '"' => {
                let triple = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
                let start_line = line;
                i += if triple { 3 } else { 1 };
                let mut closed = false;
                while i < chars.len() {
                    let s = chars[i];
                    if s == '\\' {
                        if chars.get(i + 1) == Some(&'\n') {
                            line += 1;
                        }
                        i += 2;
                        continue;
                    }
                    if s == '\n' {
                        if !triple {
                            break;
                        }
                        line += 1;
                    }
                    if s == c
                        && (!triple
                            || (i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c))
                    {
                        i += if triple { 3 } else { 1 };
                        closed = true;
                        break;
                    }
                    i += 1;
                }
                if !closed {
                    return Err(format!("unterminated string starting at line {start_line}"));
                }
                logical.push('_');
                continue;
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "'{c}' at line {line} does not match '{open}' from line {open_line}"
                        ))
                    }
                    None => return Err(format!("unmatched '{c}' at line {line}")),
                }
            }
            ':' if stack.is_empty() => header_colon = true,
            '\n' => {
                let continued = logical.trim_end().ends_with('\\');
                if stack.is_empty() && !continued {
                    check_header(&logical, header_colon, logical_start)?;
                    logical.clear();
                    header_colon = false;
                    logical_start = line + 1;
                }
                line += 1;
                i += 1;
                continue;
            }
            _ => {}
        }
        logical.push(c);
        i += 1;
    }

    if let Some((open, open_line)) = stack.pop() {
        return Err(format!("'{open}' opened at line {open_line} is never closed"));
    }
    check_header(&logical, header_colon, logical_start)
}

fn check_header(logical: &str, has_colon: bool, line: usize) -> Result<(), String> {
    let first = logical
        .trim_start()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("");
    if BLOCK_KEYWORDS.contains(&first) && !has_colon {
        return Err(format!("expected ':' after '{first}' block header at line {line}"));
    }
    Ok(())
}
