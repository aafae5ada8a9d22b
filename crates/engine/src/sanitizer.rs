//! Secret redaction for notification content.
//!
//! A fixed catalog of matchers replaces credentials, tokens, connection
//! strings and private keys with `[REDACTED]`, keeping the surrounding text
//! and, for `key=value` forms, the key name.
//!
//! Sanitization never fails. If a matcher cannot be compiled, panics, or the
//! input is too large to scan, the text goes through a coarse token-by-token
//! pass instead and the result is flagged as degraded.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock};

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

pub const DEFAULT_MAX_SCAN_BYTES: usize = 1024 * 1024;

/// One catalog entry: a pattern and its `regex` replacement template.
#[derive(Debug, Clone, Copy)]
pub struct SecretPattern {
    pub name: &'static str,
    pub pattern: &'static str,
    pub replacement: &'static str,
}

pub const SECRET_PATTERNS: &[SecretPattern] = &[
    SecretPattern {
        name: "private_key_block",
        pattern: r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "url_credentials",
        pattern: r"(?P<scheme>\b[a-zA-Z][a-zA-Z0-9+.\-]*://)(?P<user>[^:/@\s]+):[^@/\s]+@",
        replacement: "${scheme}${user}:[REDACTED]@",
    },
    SecretPattern {
        name: "bearer_token",
        pattern: r"(?i)\b(?P<scheme>bearer)\s+[A-Za-z0-9\-._~+/]+=*",
        replacement: "${scheme} [REDACTED]",
    },
    SecretPattern {
        name: "basic_auth",
        pattern: r"(?i)\b(?P<scheme>basic)\s+[A-Za-z0-9+/]{8,}=*",
        replacement: "${scheme} [REDACTED]",
    },
    SecretPattern {
        name: "json_secret_field",
        pattern: r#"(?i)(?P<key>"(?:password|passwd|secret|token|api_?key|access_?token|refresh_?token|client_?secret)"\s*:\s*)"[^"]*""#,
        replacement: r#"${key}"[REDACTED]""#,
    },
    SecretPattern {
        name: "key_value_secret",
        pattern: r#"(?i)(?P<key>\b(?:password|passwd|pwd|secret|api[_\-]?key|apikey|access[_\-]?token|auth[_\-]?token|refresh[_\-]?token|client[_\-]?secret|private[_\-]?key|token)\b\s*[=:]\s*)(?:"[^"]*"|'[^']*'|[^\s,;&"']+)"#,
        replacement: "${key}[REDACTED]",
    },
    SecretPattern {
        name: "aws_access_key_id",
        pattern: r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "aws_secret_access_key",
        pattern: r"(?i)(?P<key>aws_secret_access_key\s*[=:]\s*)[A-Za-z0-9/+=]{40}",
        replacement: "${key}[REDACTED]",
    },
    SecretPattern {
        name: "github_token",
        pattern: r"\bgh[pousr]_[A-Za-z0-9]{36,}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "gitlab_token",
        pattern: r"\bglpat-[A-Za-z0-9\-_]{20,}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "slack_token",
        pattern: r"\bxox[baprs]-[A-Za-z0-9\-]{10,}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "slack_webhook",
        pattern: r"https://hooks\.slack\.com/services/[A-Za-z0-9/_\-]+",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "stripe_key",
        pattern: r"\b[rs]k_(?:live|test)_[A-Za-z0-9]{16,}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "google_api_key",
        pattern: r"\bAIza[0-9A-Za-z\-_]{35}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "jwt",
        pattern: r"\beyJ[A-Za-z0-9_\-]{5,}\.[A-Za-z0-9_\-]{5,}\.[A-Za-z0-9_\-]{5,}",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "sendgrid_key",
        pattern: r"\bSG\.[A-Za-z0-9_\-]{22}\.[A-Za-z0-9_\-]{43}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "twilio_key",
        pattern: r"\bSK[0-9a-fA-F]{32}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "openai_key",
        pattern: r"\bsk-[A-Za-z0-9_\-]{32,}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "npm_token",
        pattern: r"\bnpm_[A-Za-z0-9]{36}\b",
        replacement: "[REDACTED]",
    },
    SecretPattern {
        name: "azure_account_key",
        pattern: r"(?i)(?P<key>AccountKey\s*=\s*)[A-Za-z0-9+/=]+",
        replacement: "${key}[REDACTED]",
    },
    SecretPattern {
        name: "signed_url_signature",
        pattern: r"(?i)(?P<key>[?&](?:sig|signature|x-amz-signature)=)[^&\s]+",
        replacement: "${key}[REDACTED]",
    },
];

type RedactFn = dyn Fn(&str) -> String + Send + Sync;

struct Matcher {
    name: String,
    /// `None` when the pattern failed to compile.
    redact: Option<Box<RedactFn>>,
}

fn compile(pattern: &SecretPattern) -> Matcher {
    let redact: Option<Box<RedactFn>> = match Regex::new(pattern.pattern) {
        Ok(regex) => {
            let replacement = pattern.replacement;
            Some(Box::new(move |text: &str| {
                regex.replace_all(text, replacement).into_owned()
            }))
        }
        Err(e) => {
            tracing::error!(matcher = pattern.name, error = %e, "Secret pattern failed to compile");
            None
        }
    };
    Matcher {
        name: pattern.name.to_string(),
        redact,
    }
}

static DEFAULT_MATCHERS: LazyLock<Vec<Arc<Matcher>>> =
    LazyLock::new(|| SECRET_PATTERNS.iter().map(|p| Arc::new(compile(p))).collect());

/// Result of sanitizing one string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    /// The coarse fallback pass had to be used.
    pub degraded: bool,
}

#[derive(Clone)]
pub struct Sanitizer {
    matchers: Vec<Arc<Matcher>>,
    max_scan_bytes: usize,
}

impl Sanitizer {
    /// Sanitizer using the built-in catalog.
    pub fn new(max_scan_bytes: usize) -> Self {
        Self {
            matchers: DEFAULT_MATCHERS.clone(),
            max_scan_bytes,
        }
    }

    /// Sanitizer using a custom catalog.
    pub fn with_patterns(patterns: &[SecretPattern], max_scan_bytes: usize) -> Self {
        Self {
            matchers: patterns.iter().map(|p| Arc::new(compile(p))).collect(),
            max_scan_bytes,
        }
    }

    /// Append a custom redactor after the catalog.
    pub fn with_redactor<F>(mut self, name: impl Into<String>, redact: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.matchers.push(Arc::new(Matcher {
            name: name.into(),
            redact: Some(Box::new(redact)),
        }));
        self
    }

    pub fn sanitize(&self, text: &str) -> Sanitized {
        if text.len() > self.max_scan_bytes {
            tracing::warn!(
                bytes = text.len(),
                limit = self.max_scan_bytes,
                "Content exceeds scan limit, using coarse redaction"
            );
            return Sanitized {
                text: coarse_redact(text),
                degraded: true,
            };
        }

        let mut output = text.to_string();
        let mut degraded = false;

        for matcher in &self.matchers {
            let Some(redact) = &matcher.redact else {
                degraded = true;
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| redact(&output))) {
                Ok(redacted) => output = redacted,
                Err(_) => {
                    tracing::error!(matcher = %matcher.name, "Secret matcher panicked");
                    degraded = true;
                }
            }
        }

        if degraded {
            output = coarse_redact(&output);
        }

        Sanitized {
            text: output,
            degraded,
        }
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCAN_BYTES)
    }
}

const SECRET_KEY_HINTS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "token",
    "apikey",
    "api_key",
    "api-key",
    "credential",
    "private_key",
    "accountkey",
    "authorization",
];

fn is_secret_key(key: &str) -> bool {
    let key = key
        .trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace())
        .to_ascii_lowercase();
    !key.is_empty() && SECRET_KEY_HINTS.iter().any(|hint| key.contains(hint))
}

fn looks_like_token(token: &str) -> bool {
    let core = token.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    core.len() >= 24
        && core
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '/' | '=' | '.'))
        && core.chars().any(|c| c.is_ascii_digit())
        && core.chars().any(|c| c.is_ascii_alphabetic())
}

fn redact_url_userinfo(token: &str) -> Option<String> {
    let scheme_end = token.find("://")? + 3;
    let at = scheme_end + token[scheme_end..].find('@')?;
    if token[scheme_end..at].contains('/') {
        return None;
    }
    Some(format!("{}{}{}", &token[..scheme_end], REDACTED, &token[at..]))
}

/// Coarse redaction that needs no pattern engine.
///
/// Works on whitespace-separated tokens: values of secret-looking keys,
/// the word after `Bearer`/`Basic` or a bare `password:` key, userinfo of
/// credentialed URLs and long mixed alphanumeric tokens are replaced.
pub fn coarse_redact(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut redact_next = false;

    for piece in text.split_inclusive(char::is_whitespace) {
        let token = piece.trim_end();
        let whitespace = &piece[token.len()..];

        if token.is_empty() {
            output.push_str(whitespace);
            continue;
        }

        if redact_next {
            redact_next = false;
            output.push_str(REDACTED);
            output.push_str(whitespace);
            continue;
        }

        let redacted = if let Some(idx) = token.find(['=', ':']).filter(|i| !token[*i..].starts_with("://")) {
            let (key, value) = token.split_at(idx + 1);
            if is_secret_key(&key[..idx]) {
                if value.is_empty() {
                    redact_next = true;
                    token.to_string()
                } else {
                    format!("{}{}", key, REDACTED)
                }
            } else if let Some(url) = redact_url_userinfo(token) {
                url
            } else if looks_like_token(value) {
                format!("{}{}", key, REDACTED)
            } else {
                token.to_string()
            }
        } else if token.eq_ignore_ascii_case("bearer") || token.eq_ignore_ascii_case("basic") {
            redact_next = true;
            token.to_string()
        } else if let Some(url) = redact_url_userinfo(token) {
            url
        } else if looks_like_token(token) {
            REDACTED.to_string()
        } else {
            token.to_string()
        };

        output.push_str(&redacted);
        output.push_str(whitespace);
    }

    output
}
