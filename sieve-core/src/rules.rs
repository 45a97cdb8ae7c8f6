//! Connectivity check rules

use serde::{Deserialize, Serialize};

/// One way of confirming that a candidate relays plain HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRule {
    /// Free-form tag, e.g. `"get"`
    #[serde(default = "default_kind")]
    pub kind: String,
    pub url: String,
    /// Word the fetched body must contain
    pub word: String,
    /// Overrides the caller's default user agent when set
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Zero means unbounded
    #[serde(default)]
    pub max_body_bytes: usize,
}

fn default_kind() -> String {
    "get".to_string()
}

impl CheckRule {
    pub fn new(url: &str, word: &str) -> Self {
        Self {
            kind: default_kind(),
            url: url.to_string(),
            word: word.to_string(),
            user_agent: None,
            max_body_bytes: 0,
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string());
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// User agent for this rule, or `fallback` when the rule has none
    pub fn user_agent_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self.user_agent.as_deref() {
            Some(ua) if !ua.is_empty() => ua,
            _ => fallback,
        }
    }
}

/// File layout of a rule list: a sequence of `[[rule]]` tables
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckRuleSet {
    #[serde(rename = "rule", default)]
    pub rules: Vec<CheckRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_set_from_toml() {
        let set: CheckRuleSet = toml::from_str(
            r#"
            [[rule]]
            url = "http://www.example.com/"
            word = "Example Domain"
            max_body_bytes = 4096

            [[rule]]
            kind = "get"
            url = "http://httpbin.org/get"
            word = "origin"
            user_agent = "curl/8.0"
            "#,
        )
        .unwrap();

        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[0].kind, "get");
        assert_eq!(set.rules[0].max_body_bytes, 4096);
        assert_eq!(set.rules[1].user_agent.as_deref(), Some("curl/8.0"));
    }

    #[test]
    fn test_user_agent_fallback() {
        let rule = CheckRule::new("http://a/", "a");
        assert_eq!(rule.user_agent_or("default"), "default");

        let rule = rule.with_user_agent("custom");
        assert_eq!(rule.user_agent_or("default"), "custom");
    }
}
