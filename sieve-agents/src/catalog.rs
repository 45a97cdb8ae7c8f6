//! Crawl and check catalog loading
//!
//! Three TOML layouts:
//! - a task file with `[[task]]` tables naming a template each
//! - a template directory with one `<name>.toml` per template
//! - a rule file with `[[rule]]` tables
//!
//! Templates are loaded once per name and shared by every task using them.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use sieve_core::{CheckRule, CheckRuleSet, CrawlTemplate};

use crate::CrawlTask;

/// Configuration loading failures; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Task {url} uses unknown template {template:?}")]
    MissingTemplate { url: String, template: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Read and deserialize one TOML file
pub fn load_toml<T, P>(path: P) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// One seed entry of a task file
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDef {
    pub url: String,
    pub template: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub wait_secs: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

fn default_max_depth() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(rename = "task", default)]
    tasks: Vec<TaskDef>,
}

/// Lazily loaded templates from a directory
#[derive(Debug)]
pub struct TemplateCache {
    dir: PathBuf,
    loaded: HashMap<String, Arc<CrawlTemplate>>,
}

impl TemplateCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            loaded: HashMap::new(),
        }
    }

    /// Template `<dir>/<name>.toml`, loaded on first use
    pub fn get(&mut self, name: &str) -> Result<Arc<CrawlTemplate>, ConfigError> {
        if let Some(template) = self.loaded.get(name) {
            return Ok(template.clone());
        }

        let path = self.dir.join(format!("{}.toml", name));
        let template: CrawlTemplate = load_toml(&path)?;
        debug!("Loaded template {} with {} entries", name, template.entries.len());

        let template = Arc::new(template);
        self.loaded.insert(name.to_string(), template.clone());
        Ok(template)
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

/// Load the crawl seeds, resolving each task's template
pub fn load_tasks<P: AsRef<Path>>(
    path: P,
    templates: &mut TemplateCache,
) -> Result<Vec<CrawlTask>, ConfigError> {
    let file: TaskFile = load_toml(path.as_ref())?;

    let mut tasks = Vec::with_capacity(file.tasks.len());
    for def in file.tasks {
        let template = match templates.get(&def.template) {
            Ok(template) => template,
            Err(ConfigError::Io { .. }) => {
                return Err(ConfigError::MissingTemplate {
                    url: def.url,
                    template: def.template,
                })
            }
            Err(e) => return Err(e),
        };

        let mut task = CrawlTask::seed(&def.url, template, def.max_depth).with_wait(def.wait_secs);
        if let Some(ua) = &def.user_agent {
            task = task.with_user_agent(ua);
        }
        tasks.push(task);
    }

    info!(
        "Loaded {} crawl tasks using {} templates",
        tasks.len(),
        templates.len()
    );
    Ok(tasks)
}

/// Load connectivity check rules; an empty list is rejected
pub fn load_rules<P: AsRef<Path>>(path: P) -> Result<Vec<CheckRule>, ConfigError> {
    let set: CheckRuleSet = load_toml(path.as_ref())?;
    if set.rules.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "no check rules in {}",
            path.as_ref().display()
        )));
    }
    Ok(set.rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_core::EntryKind;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sieve-catalog-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("templates")).unwrap();
        dir
    }

    const TEMPLATE: &str = r##"
name = "plain"

[[entry]]
name = "ip_port"
kind = "content-regex"
pattern = '(\d+\.\d+\.\d+\.\d+):(\d+)'
value = "#1#:#2#"
"##;

    #[test]
    fn test_load_tasks_shares_templates() {
        let dir = scratch_dir();
        std::fs::write(dir.join("templates/plain.toml"), TEMPLATE).unwrap();
        std::fs::write(
            dir.join("tasks.toml"),
            r#"
            [[task]]
            url = "http://a.test/"
            template = "plain"
            wait_secs = 3
            max_depth = 2

            [[task]]
            url = "http://b.test/"
            template = "plain"
            user_agent = "custom"
            "#,
        )
        .unwrap();

        let mut cache = TemplateCache::new(dir.join("templates"));
        let tasks = load_tasks(dir.join("tasks.toml"), &mut cache).unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&tasks[0].template, &tasks[1].template));
        assert_eq!(tasks[0].template.entries[0].kind, EntryKind::ContentRegex);
        assert_eq!(tasks[0].wait_secs, 3);
        assert_eq!(tasks[0].max_depth, 2);
        assert_eq!(tasks[1].max_depth, 1);
        assert_eq!(tasks[1].user_agent.as_deref(), Some("custom"));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_template_is_an_error() {
        let dir = scratch_dir();
        std::fs::write(
            dir.join("tasks.toml"),
            "[[task]]\nurl = \"http://a.test/\"\ntemplate = \"nope\"\n",
        )
        .unwrap();

        let mut cache = TemplateCache::new(dir.join("templates"));
        let result = load_tasks(dir.join("tasks.toml"), &mut cache);
        assert!(matches!(result, Err(ConfigError::MissingTemplate { .. })));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_load_rules() {
        let dir = scratch_dir();
        std::fs::write(
            dir.join("rules.toml"),
            "[[rule]]\nurl = \"http://www.example.com/\"\nword = \"Example\"\n",
        )
        .unwrap();
        std::fs::write(dir.join("empty.toml"), "").unwrap();
        std::fs::write(dir.join("broken.toml"), "[[rule]\n").unwrap();

        assert_eq!(load_rules(dir.join("rules.toml")).unwrap().len(), 1);
        assert!(matches!(load_rules(dir.join("empty.toml")), Err(ConfigError::Invalid(_))));
        assert!(matches!(load_rules(dir.join("broken.toml")), Err(ConfigError::Parse { .. })));
        assert!(matches!(load_rules(dir.join("missing.toml")), Err(ConfigError::Io { .. })));

        std::fs::remove_dir_all(dir).unwrap();
    }
}
