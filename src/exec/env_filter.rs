//! Environment Filtering
//!
//! Strips credential-bearing variables from the environment handed to a
//! child process. A variable whose name starts (case-insensitively) with a
//! sensitive prefix, followed by either the end of the name or `_`, is
//! dropped unless the target command is whitelisted for that exact variable.

use std::collections::{HashMap, HashSet};

/// Name prefixes that mark a variable as carrying a credential
pub const SENSITIVE_PREFIXES: &[&str] = &[
    "AWS_SECRET",
    "GITHUB_TOKEN",
    "GITLAB_TOKEN",
    "NPM_TOKEN",
    "DOCKER_PASSWORD",
    "DATABASE_PASSWORD",
    "API_KEY",
    "SECRET",
    "PRIVATE_KEY",
];

/// Per-command exceptions to the sensitive-prefix rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvWhitelist {
    /// Command name -> upper-cased variable names it may see
    entries: HashMap<String, HashSet<String>>,
}

impl EnvWhitelist {
    /// Create an empty whitelist
    pub fn new() -> Self {
        Self::default()
    }

    /// Whitelist used when nothing is configured
    ///
    /// Release tooling needs forge tokens to publish artifacts.
    pub fn release_defaults() -> Self {
        Self::new().allow("goreleaser", ["GITHUB_TOKEN", "GITLAB_TOKEN", "GITEA_TOKEN"])
    }

    /// Let `command` see the given variables
    pub fn allow<I, S>(mut self, command: impl Into<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.entries
            .entry(command.into())
            .or_default()
            .extend(vars.into_iter().map(|v| v.as_ref().to_ascii_uppercase()));
        self
    }

    /// Check whether `command` may see `var`
    pub fn permits(&self, command: &str, var: &str) -> bool {
        self.entries
            .get(command)
            .is_some_and(|vars| vars.contains(&var.to_ascii_uppercase()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Commands with at least one exception
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl<C, V> FromIterator<(C, Vec<V>)> for EnvWhitelist
where
    C: Into<String>,
    V: AsRef<str>,
{
    fn from_iter<T: IntoIterator<Item = (C, Vec<V>)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Self::new(), |list, (command, vars)| list.allow(command, vars))
    }
}

/// Check whether a variable name starts with a sensitive prefix
///
/// The prefix must end the name or be followed by `_`, so `SECRET_KEY`
/// matches `SECRET` but `SECRETARY` does not.
pub fn is_sensitive(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_PREFIXES.iter().any(|prefix| {
        upper.starts_with(prefix)
            && (upper.len() == prefix.len() || upper.as_bytes()[prefix.len()] == b'_')
    })
}

/// Filter applied to every outgoing environment
#[derive(Debug, Clone, Default)]
pub struct EnvFilter {
    whitelist: EnvWhitelist,
}

impl EnvFilter {
    pub fn new(whitelist: EnvWhitelist) -> Self {
        Self { whitelist }
    }

    pub fn whitelist(&self) -> &EnvWhitelist {
        &self.whitelist
    }

    /// Decide whether one `KEY=VALUE` entry reaches `command`
    ///
    /// Entries without `=` or with an empty key are kept as-is.
    pub fn keeps(&self, entry: &str, command: &str) -> bool {
        match entry.split_once('=') {
            Some((key, _)) if !key.is_empty() => {
                !is_sensitive(key) || self.whitelist.permits(command, key)
            }
            _ => true,
        }
    }

    /// Return the entries of `env` that `command` may see
    ///
    /// The input is not modified and order is preserved, so filtering the
    /// result again yields the same list.
    ///
    /// # Example
    ///
    /// ```
    /// use buildguard::exec::{EnvFilter, EnvWhitelist};
    ///
    /// let filter = EnvFilter::new(EnvWhitelist::new());
    /// let env = ["API_KEY=x", "PATH=/bin"];
    /// assert_eq!(filter.filter(&env, "build"), vec!["PATH=/bin".to_string()]);
    /// ```
    pub fn filter<S: AsRef<str>>(&self, env: &[S], command: &str) -> Vec<String> {
        env.iter()
            .map(AsRef::as_ref)
            .filter(|entry| self.keeps(entry, command))
            .map(str::to_string)
            .collect()
    }
}
