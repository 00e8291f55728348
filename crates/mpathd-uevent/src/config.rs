use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, ensure, Context, Result};
use regex::Regex;

/// Devnode allow/deny lists. An allow (exception) match wins, then a deny
/// match rejects; kernel names matching neither list are accepted.
#[derive(Debug, Default)]
pub struct DevnodeFilter {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl DevnodeFilter {
    pub fn new(allow: Vec<Regex>, deny: Vec<Regex>) -> Self {
        Self { allow, deny }
    }

    /// Compile pattern strings into a filter.
    pub fn compile(allow: &[String], deny: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern)
                        .with_context(|| format!("compile devnode pattern `{pattern}`"))
                })
                .collect()
        };
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    pub fn accepts(&self, kernel: &str) -> bool {
        if self.allow.iter().any(|re| re.is_match(kernel)) {
            return true;
        }
        !self.deny.iter().any(|re| re.is_match(kernel))
    }
}

/// Maps a kernel-name prefix to the environment key carrying the wwid
/// for that device class, e.g. `sd:ID_SERIAL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UidAttrRule {
    pub prefix: String,
    pub key: String,
}

impl FromStr for UidAttrRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, key) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("uid attribute rule `{s}` is not PREFIX:ENV_KEY"))?;
        ensure!(
            !prefix.is_empty() && !key.is_empty(),
            "uid attribute rule `{s}` has an empty side"
        );
        Ok(Self {
            prefix: prefix.to_string(),
            key: key.to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub struct MultipathConfig {
    pub devnode_filter: DevnodeFilter,
    pub uid_attrs: Vec<UidAttrRule>,
}

impl MultipathConfig {
    /// Merging runs only when identifier rules exist.
    pub fn merging_enabled(&self) -> bool {
        !self.uid_attrs.is_empty()
    }

    /// Environment key carrying the wwid for `kernel`, per the first
    /// matching prefix rule.
    pub fn uid_attribute(&self, kernel: &str) -> Option<&str> {
        self.uid_attrs
            .iter()
            .find(|rule| kernel.starts_with(&rule.prefix))
            .map(|rule| rule.key.as_str())
    }
}

/// Shared configuration handle.
///
/// [`snapshot`](Self::snapshot) hands out a reference-counted view that
/// stays valid for the scope that acquired it, whatever exit path that
/// scope takes; [`replace`](Self::replace) installs a new configuration
/// for subsequent snapshots.
#[derive(Default)]
pub struct ConfigStore {
    current: RwLock<Arc<MultipathConfig>>,
}

impl ConfigStore {
    pub fn new(config: MultipathConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<MultipathConfig> {
        self.current.read().expect("config lock poisoned").clone()
    }

    pub fn replace(&self, config: MultipathConfig) {
        *self.current.write().expect("config lock poisoned") = Arc::new(config);
    }
}
