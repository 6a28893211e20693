//! Input Validation Module
//!
//! This module checks untrusted strings before they reach a child process.
//! Every validator is a pure function, so they can be called from any task
//! without synchronization.
//!
//! Besides the per-category validators, [`CommandValidator`] applies the
//! command allowlist and argument checks used by the secure executor.

use super::error::{ExecError, ValidationError, ValidationKind};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// The single absolute root that paths may live under
pub const ALLOWED_ABSOLUTE_ROOT: &str = "/tmp";

/// Substrings that change meaning once a shell sees the argument
const INJECTION_PATTERNS: &[&str] = &["$(", "`", "&&", "||", ";", ">", "<", "${IFS}"];

/// Characters whose presence makes a piped argument look like a regex
const REGEX_HINTS: &[char] = &[
    '^', '$', '[', ']', '(', ')', '+', '*', '?', '.', '{', '}', '\\',
];

/// Commands that betray a pipeline hiding inside a regex-looking argument
const PIPE_TARGETS: &[&str] = &[
    "cat", "rm", "wget", "curl", "bash", "sh", "nc", "python", "perl", "ruby", "chmod", "chown",
    "mv", "cp", "dd", "head", "tail", "grep", "awk", "sed", "xargs", "find", "exec", "eval",
    "source", "env", "sudo",
];

/// Characters never valid in a command name
const COMMAND_NAME_METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '(', ')', '<', '>', '*', '?'];

/// Characters with meaning in git ref syntax
const GIT_REF_FORBIDDEN: &[&str] = &["..", "~", "^", ":", "\\", "*", "?", "[", " "];

/// Case-insensitive markers of script or markup injection inside a URL
const URL_SUSPICIOUS: &[&str] = &[
    "javascript:",
    "data:",
    "vbscript:",
    "file:",
    "about:",
    "chrome:",
    "<script",
    "%3cscript",
    "onerror=",
    "onload=",
];

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(
        r"^[0-9]+\.[0-9]+\.[0-9]+(?:-([0-9A-Za-z.\-]+))?(?:\+([0-9A-Za-z.\-]+))?$"
    )
    .expect("version pattern is valid");
    static ref GIT_REF_RE: Regex =
        Regex::new(r"^[A-Za-z0-9._/\-]+$").expect("git ref pattern is valid");
    static ref FILENAME_RE: Regex =
        Regex::new(r"^[A-Za-z0-9._\-]+$").expect("filename pattern is valid");
}

fn first_control(input: &str) -> Option<char> {
    input.chars().find(|c| c.is_control())
}

fn reject_control(input: &str, reason: &'static str) -> Result<(), ValidationError> {
    match first_control(input) {
        Some(c) => Err(ValidationError::new(
            ValidationKind::ControlCharacter,
            reason,
            c.to_string(),
        )),
        None => Ok(()),
    }
}

/// Decode raw bytes, rejecting anything that is not UTF-8
pub fn validate_utf8(input: &[u8]) -> Result<&str, ValidationError> {
    std::str::from_utf8(input).map_err(|e| {
        let start = e.valid_up_to();
        let end = (start + 8).min(input.len());
        ValidationError::new(
            ValidationKind::InvalidEncoding,
            "input is not valid UTF-8",
            String::from_utf8_lossy(&input[start..end]).into_owned(),
        )
    })
}

/// Validate a single command argument
///
/// Rejects command substitution, chaining, separators and redirection.
/// A lone `|` is tolerated when the argument is an http(s) URL or looks like
/// a regex, unless the text after the pipe starts with a well-known command.
/// Quotes, brackets, globs, Unicode text and `$VAR` / `${VAR}` references
/// pass.
///
/// # Example
///
/// ```
/// use buildguard::exec::validate_command_arg;
///
/// assert!(validate_command_arg("$(whoami)").is_err());
/// assert!(validate_command_arg("https://x.com?a=1&b=2").is_ok());
/// ```
pub fn validate_command_arg(arg: &str) -> Result<(), ValidationError> {
    if arg.contains('\0') {
        return Err(ValidationError::new(
            ValidationKind::ControlCharacter,
            "argument contains a NUL byte",
            "\0",
        ));
    }

    for pattern in INJECTION_PATTERNS {
        if arg.contains(pattern) {
            return Err(ValidationError::new(
                ValidationKind::Injection,
                "argument contains a shell metacharacter sequence",
                *pattern,
            ));
        }
    }

    if arg.contains('|') {
        let is_url = arg.starts_with("http://") || arg.starts_with("https://");
        let looks_like_regex = arg.contains(REGEX_HINTS);

        if !is_url && !looks_like_regex {
            return Err(ValidationError::new(
                ValidationKind::Injection,
                "argument contains a pipe outside a URL or regex",
                "|",
            ));
        }

        if looks_like_regex && pipes_into_command(arg) {
            return Err(ValidationError::new(
                ValidationKind::Injection,
                "argument pipes into a shell command",
                "|",
            ));
        }
    }

    Ok(())
}

/// Validate an argument given as raw bytes
pub fn validate_command_arg_bytes(arg: &[u8]) -> Result<&str, ValidationError> {
    let arg = validate_utf8(arg)?;
    validate_command_arg(arg)?;
    Ok(arg)
}

fn pipes_into_command(arg: &str) -> bool {
    let Some((_, after)) = arg.split_once('|') else {
        return false;
    };
    let after = after.trim_start();

    PIPE_TARGETS.iter().any(|cmd| {
        after == *cmd
            || after
                .strip_prefix(cmd)
                .is_some_and(|rest| rest.starts_with(char::is_whitespace))
    })
}

/// Validate a path and return its lexically cleaned form
///
/// Relative paths must not escape their base directory once cleaned, and
/// absolute paths must live under [`ALLOWED_ABSOLUTE_ROOT`].
///
/// # Example
///
/// ```
/// use buildguard::exec::validate_path;
/// use std::path::PathBuf;
///
/// assert_eq!(validate_path("a/b/../c").unwrap(), PathBuf::from("a/c"));
/// assert!(validate_path("a/../../etc/passwd").is_err());
/// ```
pub fn validate_path(path: &str) -> Result<PathBuf, ValidationError> {
    validate_path_within(path, Path::new(ALLOWED_ABSOLUTE_ROOT))
}

/// Validate a path, allowing absolute paths only under `root`
pub fn validate_path_within(path: &str, root: &Path) -> Result<PathBuf, ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "path is empty",
            "",
        ));
    }
    if path.contains('\0') {
        return Err(ValidationError::new(
            ValidationKind::ControlCharacter,
            "path contains a NUL byte",
            "\0",
        ));
    }
    reject_control(path, "path contains a control character")?;

    if is_foreign_absolute(path) {
        return Err(ValidationError::new(
            ValidationKind::Traversal,
            "drive-letter and UNC paths are not allowed",
            path,
        ));
    }

    let cleaned = clean_path(path);
    if cleaned.starts_with("..") {
        return Err(ValidationError::new(
            ValidationKind::Traversal,
            "path escapes its base directory",
            "..",
        ));
    }
    if cleaned.has_root() && !cleaned.starts_with(root) {
        return Err(ValidationError::new(
            ValidationKind::Traversal,
            "absolute path is outside the allowed root",
            cleaned.to_string_lossy().into_owned(),
        ));
    }

    Ok(cleaned)
}

/// Check a working directory: no control characters and no escaping `..`
///
/// Unlike [`validate_path`], absolute directories anywhere are accepted.
pub fn validate_working_dir(dir: &Path) -> Result<PathBuf, ValidationError> {
    let text = dir.to_str().ok_or_else(|| {
        ValidationError::new(
            ValidationKind::InvalidEncoding,
            "working directory is not valid UTF-8",
            dir.to_string_lossy().into_owned(),
        )
    })?;
    reject_control(text, "working directory contains a control character")?;

    let cleaned = clean_path(text);
    if cleaned.starts_with("..") {
        return Err(ValidationError::new(
            ValidationKind::Traversal,
            "working directory escapes its base directory",
            "..",
        ));
    }
    Ok(cleaned)
}

fn is_foreign_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    drive || path.starts_with("\\\\")
}

/// Lexically clean a path, treating both `/` and `\` as separators
///
/// `.` segments and empty segments are dropped, `..` removes the previous
/// segment where one exists. Leading `..` segments of relative paths are
/// kept; `..` at the root of an absolute path is dropped.
pub fn clean_path(path: &str) -> PathBuf {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(last) if *last != ".." => {
                    segments.pop();
                }
                _ if rooted => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if rooted {
        PathBuf::from(format!("/{}", joined))
    } else if joined.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(joined)
    }
}

/// Validate a semantic version such as `v1.2.3-rc.1+build.9`
///
/// # Example
///
/// ```
/// use buildguard::exec::validate_version;
///
/// assert!(validate_version("v1.2.3").is_ok());
/// assert!(validate_version("vv1.0.0").is_err());
/// ```
pub fn validate_version(version: &str) -> Result<(), ValidationError> {
    if version.contains("..") {
        return Err(ValidationError::new(
            ValidationKind::Traversal,
            "version contains a path traversal pattern",
            "..",
        ));
    }
    for pattern in ["$(", "`"] {
        if version.contains(pattern) {
            return Err(ValidationError::new(
                ValidationKind::Injection,
                "version contains a command substitution",
                pattern,
            ));
        }
    }
    reject_control(version, "version contains a control character")?;

    let core = version.strip_prefix('v').unwrap_or(version);
    if core.starts_with('v') {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "double 'v' prefix",
            "vv",
        ));
    }

    let caps = VERSION_RE.captures(core).ok_or_else(|| {
        ValidationError::new(
            ValidationKind::FormatMismatch,
            "expected MAJOR.MINOR.PATCH with optional -pre and +build",
            version,
        )
    })?;

    for suffix in [caps.get(1), caps.get(2)].into_iter().flatten() {
        if suffix.as_str().split('.').any(str::is_empty) {
            return Err(ValidationError::new(
                ValidationKind::FormatMismatch,
                "version suffix has an empty identifier",
                suffix.as_str(),
            ));
        }
    }

    Ok(())
}

/// Validate a version given as raw bytes
pub fn validate_version_bytes(version: &[u8]) -> Result<&str, ValidationError> {
    let version = validate_utf8(version)?;
    validate_version(version)?;
    Ok(version)
}

/// Validate a branch or tag name
pub fn validate_git_ref(git_ref: &str) -> Result<(), ValidationError> {
    if git_ref.is_empty() {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "git ref is empty",
            "",
        ));
    }
    reject_control(git_ref, "git ref contains a control character")?;

    for pattern in GIT_REF_FORBIDDEN {
        if git_ref.contains(pattern) {
            let kind = if *pattern == ".." {
                ValidationKind::Traversal
            } else {
                ValidationKind::FormatMismatch
            };
            return Err(ValidationError::new(
                kind,
                "git ref contains a character with ref syntax meaning",
                *pattern,
            ));
        }
    }

    if git_ref.starts_with('-') {
        return Err(ValidationError::new(
            ValidationKind::Injection,
            "git ref looks like a command-line option",
            "-",
        ));
    }

    if !GIT_REF_RE.is_match(git_ref) {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "git ref may only contain letters, digits, '-', '_', '.' and '/'",
            git_ref,
        ));
    }

    Ok(())
}

/// Validate a bare filename (no directory part)
pub fn validate_filename(filename: &str) -> Result<(), ValidationError> {
    if filename.is_empty() {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "filename is empty",
            "",
        ));
    }
    if filename == "." || filename == ".." {
        return Err(ValidationError::new(
            ValidationKind::Traversal,
            "filename is a directory reference",
            filename,
        ));
    }
    if filename.contains('\0') {
        return Err(ValidationError::new(
            ValidationKind::ControlCharacter,
            "filename contains a NUL byte",
            "\0",
        ));
    }
    reject_control(filename, "filename contains a control character")?;
    if filename.trim() != filename {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "filename has leading or trailing whitespace",
            filename,
        ));
    }
    if let Some(sep) = filename.chars().find(|c| *c == '/' || *c == '\\') {
        return Err(ValidationError::new(
            ValidationKind::Traversal,
            "filename contains a path separator",
            sep.to_string(),
        ));
    }
    if !FILENAME_RE.is_match(filename) {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "filename may only contain letters, digits, '-', '_' and '.'",
            filename,
        ));
    }

    Ok(())
}

/// Validate an http(s) URL
///
/// Scheme-like markers (`javascript:`, `file:` ...) only count when they
/// start a token, so `https://x.com/profile:me` is accepted while
/// `https://x.com/?next=javascript:alert(1)` is not.
pub fn validate_url(url: &str) -> Result<(), ValidationError> {
    if url.is_empty() {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "URL is empty",
            "",
        ));
    }
    reject_control(url, "URL contains a control character")?;
    if url.trim() != url {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "URL has leading or trailing whitespace",
            url,
        ));
    }

    let lower = url.to_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        let scheme = lower.split(':').next().unwrap_or_default();
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "URL must use the http or https scheme",
            scheme,
        ));
    }

    for pattern in URL_SUSPICIOUS {
        if lower.contains(pattern) {
            return Err(ValidationError::new(
                ValidationKind::Injection,
                "URL contains a script or markup injection marker",
                *pattern,
            ));
        }
    }

    Ok(())
}

/// Validate an email address: one `@`, non-empty sides, dotted domain
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if email.is_empty() {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "email is empty",
            "",
        ));
    }
    reject_control(email, "email contains a control character")?;

    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "email must contain exactly one '@'",
            email,
        ));
    };
    if local.is_empty() || domain.is_empty() {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "email has an empty local part or domain",
            email,
        ));
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "email domain must be dotted and not start or end with '.'",
            domain,
        ));
    }

    Ok(())
}

/// Validate a TCP/UDP port number
///
/// Ports below 1024 are accepted with a warning.
pub fn validate_port(port: i64) -> Result<u16, ValidationError> {
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            ValidationError::new(
                ValidationKind::RangeViolation,
                "port must be between 1 and 65535",
                port.to_string(),
            )
        })?;

    if port < 1024 {
        tracing::warn!("port {} is a privileged port (< 1024)", port);
    }

    Ok(port)
}

/// Validate an environment variable name
pub fn validate_env_var_name(name: &str) -> Result<(), ValidationError> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "environment variable name is empty",
            "",
        ));
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "environment variable must start with a letter or underscore",
            first.to_string(),
        ));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        return Err(ValidationError::new(
            ValidationKind::FormatMismatch,
            "environment variable may only contain letters, digits and underscores",
            bad.to_string(),
        ));
    }

    Ok(())
}

/// Command validator that enforces the allowlist and argument rules
///
/// An empty allowlist places no restriction on which program runs; names
/// are still checked for traversal and shell metacharacters. A non-empty
/// allowlist additionally rejects any name containing a path separator, so
/// `/tmp/evil/echo` cannot pass as `echo`.
#[derive(Debug, Clone, Default)]
pub struct CommandValidator {
    /// Allowlist of command names (empty means no identity restriction)
    allowed_commands: HashSet<String>,
}

impl CommandValidator {
    /// Create a validator with no allowlist
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a validator restricted to the given command names
    pub fn with_allowlist<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_commands: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate a command name and all of its arguments
    pub fn validate(&self, command: &str, args: &[&str]) -> Result<(), ExecError> {
        self.validate_name(command)
            .map_err(|e| ExecError::validation(command, None, e))?;

        for arg in args {
            validate_command_arg(arg).map_err(|e| ExecError::validation(command, Some(arg), e))?;
        }

        Ok(())
    }

    /// Validate only the command name
    pub fn validate_name(&self, command: &str) -> Result<(), ValidationError> {
        if command.is_empty() {
            return Err(ValidationError::new(
                ValidationKind::FormatMismatch,
                "command name is empty",
                "",
            ));
        }
        reject_control(command, "command name contains a control character")?;

        if self.is_restricted() && !self.allowed_commands.contains(command) {
            return Err(ValidationError::new(
                ValidationKind::NotAllowed,
                "command is not in the allowed list",
                command,
            ));
        }

        if command.contains("..") {
            return Err(ValidationError::new(
                ValidationKind::Traversal,
                "command name contains path traversal",
                "..",
            ));
        }

        if self.is_restricted() {
            if let Some(sep) = command.chars().find(|c| *c == '/' || *c == '\\') {
                return Err(ValidationError::new(
                    ValidationKind::Traversal,
                    "allowlisted command names may not contain a path separator",
                    sep.to_string(),
                ));
            }
        }

        if let Some(c) = command.chars().find(|c| COMMAND_NAME_METACHARACTERS.contains(c)) {
            return Err(ValidationError::new(
                ValidationKind::Injection,
                "command name contains a shell metacharacter",
                c.to_string(),
            ));
        }

        Ok(())
    }

    /// Whether an allowlist is active
    pub fn is_restricted(&self) -> bool {
        !self.allowed_commands.is_empty()
    }

    /// Check if a command passes the allowlist
    pub fn is_allowed(&self, command: &str) -> bool {
        !self.is_restricted() || self.allowed_commands.contains(command)
    }

    /// Get the current allowlist
    pub fn allowlist(&self) -> impl Iterator<Item = &str> {
        self.allowed_commands.iter().map(String::as_str)
    }
}
