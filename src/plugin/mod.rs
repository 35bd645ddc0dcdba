//! Declarative vulnerability checks loaded from YAML.
//!
//! A [`Plugin`] is a list of [`Test`]s; every test runs one command and feeds
//! its output through a pipeline of [`Parser`] stages. The plugin-level
//! verdict combines test verdicts with short-circuit AND/OR.

pub mod loader;
pub mod parser;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StarescError};

pub use loader::load_plugins_from_dir;
pub use parser::{Condition, ParsedResult, Parser, ParserDoc, Part, RuleSet, RuleType};
pub use test::{Test, TestDoc};

/// Descriptive fields carried through to reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: Option<String>,
    pub description: Option<String>,
    pub severity: Option<String>,
    #[serde(alias = "CVE")]
    pub cve: Option<String>,
    pub cvss: Option<f32>,
    pub cvss_vector: Option<String>,
    pub reference: Option<String>,
    pub remediation: Option<String>,
    pub author: Option<String>,
}

/// A plugin document as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginDoc {
    pub id: Option<String>,
    pub distr_matcher: Option<String>,
    pub match_condition: Option<String>,
    pub tests: Option<Vec<TestDoc>>,
    #[serde(flatten)]
    pub info: PluginInfo,
}

#[derive(Debug, Clone)]
pub struct Plugin {
    pub id: String,
    pub match_condition: Condition,
    pub info: PluginInfo,
    distr_matcher: Regex,
    tests: Vec<Test>,
}

impl Plugin {
    pub fn new(
        id: impl Into<String>,
        match_condition: Condition,
        tests: Vec<Test>,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(StarescError::Plugin("plugin id is empty".into()));
        }
        if tests.is_empty() {
            return Err(StarescError::Plugin(format!("plugin `{id}` has no tests")));
        }
        Ok(Self {
            id,
            match_condition,
            info: PluginInfo::default(),
            distr_matcher: match_all(),
            tests,
        })
    }

    pub fn from_doc(doc: PluginDoc) -> Result<Self> {
        let id = doc
            .id
            .ok_or_else(|| StarescError::Plugin("plugin without id".into()))?;
        let match_condition = doc
            .match_condition
            .as_deref()
            .map(Condition::parse)
            .transpose()?
            .unwrap_or_default();
        let tests = doc
            .tests
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(Test::from_doc)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| StarescError::Plugin(format!("plugin `{id}`: {e}")))?;

        let mut plugin = Self::new(id, match_condition, tests)?;
        if let Some(pattern) = doc.distr_matcher.as_deref() {
            plugin.distr_matcher = Regex::new(pattern).map_err(|e| {
                StarescError::Plugin(format!("plugin `{}`: invalid distr_matcher: {e}", plugin.id))
            })?;
        }
        plugin.info = doc.info;
        Ok(plugin)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let doc: PluginDoc = serde_yaml::from_str(s)
            .map_err(|e| StarescError::Plugin(format!("invalid plugin document: {e}")))?;
        Self::from_doc(doc)
    }

    pub fn distribution_matcher(&self) -> &Regex {
        &self.distr_matcher
    }

    pub fn tests(&self) -> &[Test] {
        &self.tests
    }

    /// Whether this plugin applies to a host described by `os_info`.
    pub fn applies_to(&self, os_info: &str) -> bool {
        self.distribution_matcher().is_match(os_info)
    }

    pub fn display_name(&self) -> &str {
        self.info.name.as_deref().unwrap_or(&self.id)
    }
}

static MATCH_ALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(".*").expect("match-all regex is valid"));

fn match_all() -> Regex {
    MATCH_ALL.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUDO_PLUGIN: &str = r#"
id: sudo-baron-samedit
name: Sudo Baron Samedit
description: Heap overflow in sudoedit
severity: high
cve: CVE-2021-3156
cvss: 7.8
distr_matcher: "(?i)linux"
match_condition: or
tests:
  - command: sudo -V
    parsers:
      - parser_type: extractor
        part: stdout
        rule_type: regex
        rules: ['version \d+\.\d+\.\d+(p\d+)?']
      - parser_type: matcher
        rule_type: regex
        rules: ['1\.8\.(2|3[0-1])', '1\.9\.[0-5]']
        condition: or
  - command: sudoedit -s /
    parsers:
      - parser_type: matcher
        rule_type: word
        rules: ["sudoedit:"]
        part: stderr
"#;

    #[test]
    fn parse_full_document() {
        let plugin = Plugin::from_yaml_str(SUDO_PLUGIN).unwrap();
        assert_eq!(plugin.id, "sudo-baron-samedit");
        assert_eq!(plugin.match_condition, Condition::Or);
        assert_eq!(plugin.tests().len(), 2);
        assert_eq!(plugin.tests()[1].command(), "sudoedit -s /");
        assert_eq!(plugin.info.cve.as_deref(), Some("CVE-2021-3156"));
        assert_eq!(plugin.info.cvss, Some(7.8));
        assert_eq!(plugin.display_name(), "Sudo Baron Samedit");
        assert!(plugin.applies_to("Linux host 5.4.0"));
        assert!(!plugin.applies_to("FreeBSD 13"));
    }

    #[test]
    fn defaults() {
        let plugin = Plugin::from_yaml_str(
            "id: p\ntests:\n  - command: id\n    parsers:\n      - parser_type: matcher\n        rule_type: word\n        rules: [root]\n",
        )
        .unwrap();
        assert_eq!(plugin.match_condition, Condition::And);
        assert!(plugin.applies_to(""));
        assert_eq!(plugin.display_name(), "p");
    }

    #[test]
    fn invalid_documents_are_rejected() {
        let cases = [
            "tests: []\n",
            "id: p\n",
            "id: p\ntests: []\n",
            "id: p\nmatch_condition: xor\ntests:\n  - command: id\n    parsers:\n      - parser_type: matcher\n        rule_type: word\n        rules: [root]\n",
            "id: p\ntests:\n  - command: id\n    parsers:\n      - parser_type: matcher\n        rule_type: fuzzy\n        rules: [root]\n",
            "id: p\ndistr_matcher: '('\ntests:\n  - command: id\n    parsers:\n      - parser_type: matcher\n        rule_type: word\n        rules: [root]\n",
            "id: p\ntests:\n  - command: id\n    parsers:\n      - parser_type: matcher\n        rule_type: word\n        rules: [root]\n        invert_match: maybe\n",
        ];
        for doc in cases {
            let err = Plugin::from_yaml_str(doc).unwrap_err();
            assert!(matches!(err, StarescError::Plugin(_)), "{doc}");
        }
    }
}
