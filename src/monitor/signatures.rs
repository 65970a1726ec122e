//! Every string the daemon scrapes out of tunnel/editor output lives here.
//!
//! The CLI output format is not a stable interface; when a release changes
//! its wording only this table needs to follow.

use regex::Regex;

/// Known fatal startup failures (binary incompatibility, port clash, ...).
/// Matched case-insensitively as plain substrings.
pub const FATAL_SIGNATURES: &[&str] = &[
    "error while loading shared libraries",
    "version `glibc_",
    "exec format error",
    "cannot execute binary file",
    "eaddrinuse",
    "address already in use",
    "err_require_esm",
    "unsupported platform",
    "no space left on device",
];

/// Hosts serving the device-code login page.
const AUTH_URL_PATTERN: &str =
    r"https://(?:github\.com/login/device|(?:www\.)?microsoft\.com/devicelogin|login\.microsoftonline\.com/\S*)\S*";

/// `code` followed by `XXXX-XXXX` (GitHub) or 8~9 upper-case alphanumerics (Microsoft).
const DEVICE_CODE_PATTERN: &str = r"(?i:\bcode\b)[:\s]+([A-Z0-9]{4}-[A-Z0-9]{4}|[A-Z0-9]{8,9})\b";

const TUNNEL_URL_PATTERN: &str = r"https://vscode\.dev/tunnel/\S+";

/// Provider menu printed by `code tunnel` when no provider was given.
pub const PROVIDER_PROMPT: &str = "how would you like to log in";

/// Compiled signature table.
#[derive(Debug, Clone)]
pub struct Signatures {
    re_auth_url: Regex,
    re_device_code: Regex,
    re_tunnel_url: Regex,
}

impl Default for Signatures {
    fn default() -> Self {
        Self::new()
    }
}

impl Signatures {
    pub fn new() -> Self {
        Self {
            re_auth_url: Regex::new(AUTH_URL_PATTERN).expect("hardcoded regex"),
            re_device_code: Regex::new(DEVICE_CODE_PATTERN).expect("hardcoded regex"),
            re_tunnel_url: Regex::new(TUNNEL_URL_PATTERN).expect("hardcoded regex"),
        }
    }

    /// First fatal signature contained in `line`.
    pub fn fatal(&self, line: &str) -> Option<&'static str> {
        let lower = line.to_lowercase();
        FATAL_SIGNATURES.iter().copied().find(|sig| lower.contains(sig))
    }

    pub fn auth_url(&self, line: &str) -> Option<String> {
        self.re_auth_url
            .find(line)
            .map(|m| trim_url(m.as_str()).to_string())
    }

    pub fn device_code(&self, line: &str) -> Option<String> {
        self.re_device_code
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub fn tunnel_url(&self, line: &str) -> Option<String> {
        self.re_tunnel_url
            .find(line)
            .map(|m| trim_url(m.as_str()).to_string())
    }

    pub fn is_provider_prompt(&self, line: &str) -> bool {
        line.to_lowercase().contains(PROVIDER_PROMPT)
    }
}

/// 문장 끝 구두점/괄호 제거
fn trim_url(url: &str) -> &str {
    url.trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')' | ']' | '"' | '\''))
}
