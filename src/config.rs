use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::Cli;
use crate::enhancer::EnhancerId;
use crate::ledger::default_ledger_path;

pub const DEFAULT_SOURCE: &str = "target/classes";
pub const CONF_DIR: &str = "conf";
pub const BASE_CONF: &str = "enhance.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancerSpec {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub options: toml::Table,
}

fn default_version() -> String {
    "1".to_string()
}

impl EnhancerSpec {
    pub fn id(&self) -> EnhancerId {
        EnhancerId::new(&self.name, &self.version)
    }

    /// Kind defaults to the registration name.
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.name)
    }

    pub fn option_str(&self, key: &str) -> Option<String> {
        self.options
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhanceConfig {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub recursive: bool,
    pub parallel: bool,
    pub encoding: String,
    pub log_level: String,
    pub ledger: Option<PathBuf>,
    pub platform_prefixes: Vec<String>,
    pub classpath: Vec<PathBuf>,
    pub enhancers: Vec<EnhancerSpec>,
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from(DEFAULT_SOURCE),
            destination: None,
            recursive: true,
            parallel: false,
            encoding: "UTF-8".to_string(),
            log_level: "warn".to_string(),
            ledger: None,
            platform_prefixes: Vec::new(),
            classpath: Vec::new(),
            enhancers: Vec::new(),
        }
    }
}

impl EnhanceConfig {
    pub fn destination(&self) -> &Path {
        self.destination.as_deref().unwrap_or(&self.source)
    }

    pub fn validate(&self) -> Result<()> {
        let normalized = self.encoding.to_ascii_lowercase().replace(['-', '_'], "");
        if normalized != "utf8" {
            bail!(
                "unsupported encoding `{}`: attribute payloads are written as UTF-8",
                self.encoding
            );
        }
        if self.source.as_os_str().is_empty() {
            bail!("`source` must not be empty");
        }
        Ok(())
    }
}

/// Layered configuration: an optional base file, then one file per
/// configuration id in caller order. Later layers override earlier keys.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    base: Option<PathBuf>,
    conf_dir: PathBuf,
    ids: Vec<String>,
}

impl ConfigLoader {
    pub fn new(conf_dir: impl Into<PathBuf>) -> Self {
        let conf_dir = conf_dir.into();
        Self {
            base: Some(conf_dir.join(BASE_CONF)),
            conf_dir,
            ids: Vec::new(),
        }
    }

    pub fn with_base(mut self, base: Option<PathBuf>) -> Self {
        self.base = base;
        self
    }

    pub fn with_ids(mut self, ids: &[String]) -> Self {
        self.ids = ids.to_vec();
        self
    }

    /// `dev` -> `conf/enhance_dev.toml`
    pub fn id_file(&self, id: &str) -> PathBuf {
        self.conf_dir.join(format!("enhance_{id}.toml"))
    }

    pub fn layer_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut seen = std::collections::HashSet::new();
        if let Some(base) = self.base.clone() {
            seen.insert(base.clone());
            files.push(base);
        }
        for id in &self.ids {
            let file = self.id_file(id.trim());
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
        files
    }

    pub fn load(&self) -> Result<EnhanceConfig> {
        let mut merged = toml::Table::new();
        for (idx, file) in self.layer_files().into_iter().enumerate() {
            let is_base = idx == 0 && self.base.as_ref() == Some(&file);
            if !file.exists() {
                if is_base {
                    continue;
                }
                bail!("Config file not found: {}", file.display());
            }
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read config file: {}", file.display()))?;
            let layer: toml::Table = toml::from_str(&text)
                .with_context(|| format!("Failed to parse config file: {}", file.display()))?;
            merge_tables(&mut merged, layer);
        }
        let config: EnhanceConfig = toml::Value::Table(merged)
            .try_into()
            .context("Invalid enhancer configuration")?;
        Ok(config)
    }
}

/// Deep-merges `overlay` into `base`. Nested tables merge key by key;
/// everything else, arrays included, is replaced.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        let toml::Value::Table(incoming) = value else {
            base.insert(key, value);
            continue;
        };
        if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
            merge_tables(existing, incoming);
            continue;
        }
        base.insert(key, toml::Value::Table(incoming));
    }
}

pub fn resolve_config(cli: &Cli) -> Result<EnhanceConfig> {
    let conf_dir = cli
        .conf_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONF_DIR));
    let mut loader = ConfigLoader::new(conf_dir).with_ids(&cli.ids);
    if let Some(file) = cli.config.clone() {
        if !file.exists() {
            bail!("Config file not found: {}", file.display());
        }
        loader = loader.with_base(Some(file));
    }
    let mut config = loader.load()?;

    if let Some(source) = cli.source.clone() {
        config.source = source;
    }
    if let Some(destination) = cli.destination.clone() {
        config.destination = Some(destination);
    }
    if let Some(level) = cli.log_level.clone() {
        config.log_level = level;
    }
    config.validate()?;
    Ok(config)
}

/// `None` when the ledger is disabled.
pub fn resolve_ledger_path(cli: &Cli, config: &EnhanceConfig) -> Result<Option<PathBuf>> {
    if cli.no_ledger {
        return Ok(None);
    }
    if let Some(p) = cli.ledger.clone() {
        return Ok(Some(p));
    }
    if let Some(p) = config.ledger.clone() {
        return Ok(Some(p));
    }
    Ok(Some(default_ledger_path()?))
}
