// Language toolchain configuration
use arbiter_common::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LanguageConfigError {
    #[error("language config file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse language config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate configuration for language: {0}")]
    Duplicate(Language),
    #[error("no configuration found for language: {0}")]
    Missing(Language),
}

/// A command line with `{source}`, `{entry}`, `{dir}` and `{memory_mb}` placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Values substituted into a [`CommandTemplate`]
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub source: &'a Path,
    pub entry: &'a Path,
    pub dir: &'a Path,
    pub memory_mb: u32,
}

impl CommandTemplate {
    fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Render into a program and its arguments
    pub fn render(&self, vars: &TemplateVars<'_>) -> (String, Vec<String>) {
        let substitute = |s: &str| {
            s.replace("{source}", &vars.source.to_string_lossy())
                .replace("{entry}", &vars.entry.to_string_lossy())
                .replace("{dir}", &vars.dir.to_string_lossy())
                .replace("{memory_mb}", &vars.memory_mb.to_string())
        };
        (
            substitute(&self.command),
            self.args.iter().map(|a| substitute(a)).collect(),
        )
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: Language,
    pub display_name: String,
    /// File name the submission is written to
    pub source_file: String,
    /// File executed by `run`; defaults to `source_file`
    #[serde(default)]
    pub entry_file: Option<String>,
    /// Syntax check or build step, run once per grading
    #[serde(default)]
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
    /// Files copied from the build directory into every run directory
    pub artifacts: Vec<String>,
    pub version: CommandTemplate,
    /// Headroom added to RLIMIT_AS for the runtime itself
    #[serde(default)]
    pub address_space_overhead_mb: u32,
    /// Runtimes that reserve large virtual ranges up front (V8) cannot run
    /// under RLIMIT_AS; they get a heap flag and sampled RSS instead
    #[serde(default = "default_true")]
    pub limit_address_space: bool,
}

impl LanguageConfig {
    pub fn entry_file(&self) -> &str {
        self.entry_file.as_deref().unwrap_or(&self.source_file)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Toolchain availability on this host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageAvailability {
    pub language: Language,
    pub display_name: String,
    pub available: bool,
    pub version: Option<String>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self, LanguageConfigError> {
        if !config_path.exists() {
            return Err(LanguageConfigError::NotFound(config_path.to_path_buf()));
        }

        let content = fs::read_to_string(config_path).map_err(|source| LanguageConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, LanguageConfigError> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;
        Self::from_configs(languages_json.languages)
    }

    fn from_configs(languages: Vec<LanguageConfig>) -> Result<Self, LanguageConfigError> {
        let mut configs = HashMap::new();
        for lang in languages {
            let name = lang.name;
            if configs.insert(name, lang).is_some() {
                return Err(LanguageConfigError::Duplicate(name));
            }
        }
        Ok(Self { configs })
    }

    /// Load from `config_path`, falling back to the built-in toolchains
    pub fn load_or_default(config_path: &Path) -> Self {
        match Self::load(config_path) {
            Ok(manager) => {
                debug!(path = %config_path.display(), languages = ?manager.list_languages(), "Loaded language config");
                manager
            }
            Err(e) => {
                warn!("{}; using built-in language config", e);
                Self::builtin()
            }
        }
    }

    /// Built-in toolchains: python3, node and g++ from PATH
    pub fn builtin() -> Self {
        let configs = vec![
            LanguageConfig {
                name: Language::Python,
                display_name: "Python 3".to_string(),
                source_file: "main.py".to_string(),
                entry_file: None,
                compile: Some(CommandTemplate::new("python3", &["-m", "py_compile", "{source}"])),
                run: CommandTemplate::new("python3", &["-I", "-B", "{entry}"]),
                artifacts: vec!["main.py".to_string()],
                version: CommandTemplate::new("python3", &["--version"]),
                address_space_overhead_mb: 64,
                limit_address_space: true,
            },
            LanguageConfig {
                name: Language::JavaScript,
                display_name: "JavaScript (Node.js)".to_string(),
                source_file: "main.js".to_string(),
                entry_file: None,
                compile: Some(CommandTemplate::new("node", &["--check", "{source}"])),
                run: CommandTemplate::new("node", &["--max-old-space-size={memory_mb}", "{entry}"]),
                artifacts: vec!["main.js".to_string()],
                version: CommandTemplate::new("node", &["--version"]),
                address_space_overhead_mb: 0,
                limit_address_space: false,
            },
            LanguageConfig {
                name: Language::Cpp,
                display_name: "C++17 (g++)".to_string(),
                source_file: "main.cpp".to_string(),
                entry_file: Some("main".to_string()),
                compile: Some(CommandTemplate::new(
                    "g++",
                    &["-std=c++17", "-O2", "-pipe", "-o", "{dir}/main", "{source}"],
                )),
                run: CommandTemplate::new("{entry}", &[]),
                artifacts: vec!["main".to_string()],
                version: CommandTemplate::new("g++", &["--version"]),
                address_space_overhead_mb: 16,
                limit_address_space: true,
            },
        ];

        Self {
            configs: configs.into_iter().map(|c| (c.name, c)).collect(),
        }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig, LanguageConfigError> {
        self.configs
            .get(language)
            .ok_or(LanguageConfigError::Missing(*language))
    }

    /// List configured languages in declaration order
    pub fn list_languages(&self) -> Vec<Language> {
        Language::all_variants()
            .iter()
            .copied()
            .filter(|l| self.configs.contains_key(l))
            .collect()
    }

    /// Run each configured toolchain with its version command
    pub async fn check_availability(&self) -> Vec<LanguageAvailability> {
        let mut result = Vec::new();
        for language in self.list_languages() {
            let Some(config) = self.configs.get(&language) else {
                continue;
            };
            let version = detect_version(&config.version).await;
            result.push(LanguageAvailability {
                language,
                display_name: config.display_name.clone(),
                available: version.is_some(),
                version,
            });
        }
        result
    }
}

impl Default for LanguageConfigManager {
    fn default() -> Self {
        Self::builtin()
    }
}

async fn detect_version(template: &CommandTemplate) -> Option<String> {
    let output = tokio::time::timeout(
        VERSION_CHECK_TIMEOUT,
        tokio::process::Command::new(&template.command)
            .args(&template.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }

    // some toolchains print their version on stderr
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    String::from_utf8_lossy(&text)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}
