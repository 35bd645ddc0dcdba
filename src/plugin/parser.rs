//! Matchers and extractors: the stages of a test's rule pipeline.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StarescError};

/// Which stream of a command result a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Part {
    Stdout,
    Stderr,
}

impl Part {
    pub const ALL: [Part; 2] = [Part::Stdout, Part::Stderr];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Regex,
    Word,
}

/// How several rules (or several tests) combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    #[default]
    And,
    Or,
}

impl Condition {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "and" => Ok(Condition::And),
            "or" => Ok(Condition::Or),
            other => Err(StarescError::Plugin(format!("invalid condition `{other}`"))),
        }
    }
}

/// The `{stdout, stderr}` pair that flows through a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResult {
    pub stdout: String,
    pub stderr: String,
}

impl ParsedResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn get(&self, part: Part) -> &str {
        match part {
            Part::Stdout => &self.stdout,
            Part::Stderr => &self.stderr,
        }
    }

    fn set(&mut self, part: Part, value: &str) {
        match part {
            Part::Stdout => self.stdout = value.to_string(),
            Part::Stderr => self.stderr = value.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum Rule {
    Regex(Regex),
    Word(String),
}

impl Rule {
    fn is_match(&self, text: &str) -> bool {
        match self {
            Rule::Regex(re) => re.is_match(text),
            Rule::Word(w) => text.contains(w.as_str()),
        }
    }

    /// First regex match, or the word itself when contained.
    fn extract<'a>(&'a self, text: &'a str) -> Option<&'a str> {
        match self {
            Rule::Regex(re) => re.find(text).map(|m| m.as_str()),
            Rule::Word(w) => text.contains(w.as_str()).then_some(w.as_str()),
        }
    }
}

/// Raw parser entry of a plugin document, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParserDoc {
    pub parser_type: Option<String>,
    pub part: Option<String>,
    pub rule_type: Option<String>,
    pub condition: Option<String>,
    pub rules: Option<Vec<String>>,
    pub invert_match: Option<bool>,
}

/// Validated fields shared by both parser kinds.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rule_type: RuleType,
    rules: Vec<Rule>,
    parts: Vec<Part>,
    condition: Condition,
    invert_match: bool,
}

impl RuleSet {
    pub fn new(
        rule_type: RuleType,
        rules: &[String],
        parts: Vec<Part>,
        condition: Condition,
        invert_match: bool,
    ) -> Result<Self> {
        if rules.is_empty() {
            return Err(StarescError::Plugin("no rule specified".into()));
        }
        if parts.is_empty() {
            return Err(StarescError::Plugin("no part specified".into()));
        }
        let rules = rules
            .iter()
            .map(|r| match rule_type {
                RuleType::Regex => Regex::new(r)
                    .map(Rule::Regex)
                    .map_err(|e| StarescError::Plugin(format!("invalid regex `{r}`: {e}"))),
                RuleType::Word => Ok(Rule::Word(r.clone())),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rule_type,
            rules,
            parts,
            condition,
            invert_match,
        })
    }

    fn from_doc(doc: &ParserDoc) -> Result<Self> {
        let parts = match doc.part.as_deref() {
            None => Part::ALL.to_vec(),
            Some("stdout") => vec![Part::Stdout],
            Some("stderr") => vec![Part::Stderr],
            Some(other) => return Err(StarescError::Plugin(format!("invalid part `{other}`"))),
        };
        let rule_type = match doc.rule_type.as_deref() {
            Some("regex") => RuleType::Regex,
            Some("word") => RuleType::Word,
            Some(other) => {
                return Err(StarescError::Plugin(format!("unsupported rule_type `{other}`")))
            }
            None => return Err(StarescError::Plugin("no rule_type specified".into())),
        };
        let condition = doc
            .condition
            .as_deref()
            .map(Condition::parse)
            .transpose()?
            .unwrap_or_default();
        let rules = doc.rules.as_deref().unwrap_or_default();
        Self::new(
            rule_type,
            rules,
            parts,
            condition,
            doc.invert_match.unwrap_or(false),
        )
    }

    pub fn rule_type(&self) -> RuleType {
        self.rule_type
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn invert_match(&self) -> bool {
        self.invert_match
    }

    fn hit(&self, rule: &Rule, result: &ParsedResult) -> bool {
        self.parts.iter().any(|p| rule.is_match(result.get(*p)))
    }

    /// AND stops at the first rule matching nowhere; OR stops at the first
    /// rule matching somewhere and only fails after trying them all.
    fn matches(&self, result: &ParsedResult) -> bool {
        match self.condition {
            Condition::And => {
                for rule in &self.rules {
                    if !self.hit(rule, result) {
                        return false;
                    }
                }
                true
            }
            Condition::Or => {
                for rule in &self.rules {
                    if self.hit(rule, result) {
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Only the first rule extracts. Unchecked parts come back empty.
    fn extract(&self, result: &ParsedResult) -> (bool, ParsedResult) {
        let rule = &self.rules[0];
        let mut extracted = ParsedResult::default();
        let mut found = false;
        for part in &self.parts {
            if let Some(m) = rule.extract(result.get(*part)) {
                found = true;
                extracted.set(*part, m);
            }
        }
        (found, extracted)
    }
}

/// One stage of a rule pipeline.
#[derive(Debug, Clone)]
pub enum Parser {
    /// Checks rules and passes the result through untouched.
    Matcher(RuleSet),
    /// Replaces each checked part with what the first rule found.
    Extractor(RuleSet),
}

impl Parser {
    pub fn from_doc(doc: &ParserDoc) -> Result<Self> {
        let rules = RuleSet::from_doc(doc)?;
        match doc.parser_type.as_deref() {
            Some("matcher") => Ok(Parser::Matcher(rules)),
            Some("extractor") => Ok(Parser::Extractor(rules)),
            Some(other) => Err(StarescError::Plugin(format!("invalid parser_type `{other}`"))),
            None => Err(StarescError::Plugin("no parser_type specified".into())),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        match self {
            Parser::Matcher(r) | Parser::Extractor(r) => r,
        }
    }

    pub fn evaluate(&self, result: &ParsedResult) -> (bool, ParsedResult) {
        match self {
            Parser::Matcher(rules) => {
                let matched = rules.matches(result) ^ rules.invert_match;
                (matched, result.clone())
            }
            Parser::Extractor(rules) => rules.extract(result),
        }
    }
}
