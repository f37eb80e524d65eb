use anyhow::{Context, Result, bail};
use clap::Parser;
use class_enhancer::classfile::{ClassFile, internal_to_qualified};
use class_enhancer::cli::{Cli, Commands};
use class_enhancer::config::{EnhanceConfig, resolve_config, resolve_ledger_path};
use class_enhancer::descriptor::{UnitDescriptor, UnitLocation};
use class_enhancer::eligibility::{EligibilityFilter, Verdict};
use class_enhancer::ledger::{self, Ledger};
use class_enhancer::loader::DefinedClass;
use class_enhancer::logging;
use class_enhancer::marker::{self, MarkerRecord};
use class_enhancer::registry::EnhancerRegistry;
use class_enhancer::session::EnhanceSession;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = resolve_config(&cli)?;
    let _log = logging::scoped(&config.log_level)?;

    match cli.command.clone() {
        Commands::Clear => {
            let db_path = require_ledger(&cli, &config)?;
            ledger::clear(&db_path)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&ClearResult {
                    cleared: db_path.to_string_lossy().to_string(),
                })?
            );
        }
        Commands::Stats => {
            let db_path = require_ledger(&cli, &config)?;
            let ledger = Ledger::open(db_path)?;
            let stats = ledger.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Enhance {
            no_recurse,
            parallel,
            keep_going,
        } => {
            if no_recurse {
                config.recursive = false;
            }
            if parallel {
                config.parallel = true;
            }
            let session = open_session(&cli, &config)?;
            let report = session.run_batch()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.has_failures() && !keep_going {
                bail!(
                    "{} unit(s) failed, {} write-back error(s), {} unreadable entr(ies)",
                    report.failed,
                    report.persistence_errors,
                    report.structural_errors.len()
                );
            }
        }
        Commands::Resolve { names, classpath } => {
            config.classpath.extend(classpath);
            let session = open_session(&cli, &config)?;
            let output = resolve_names(&session, &names);
            println!("{}", serde_json::to_string_pretty(&output)?);
            let failed = output.results.iter().filter(|r| r.error.is_some()).count();
            if failed > 0 {
                bail!("{failed} of {} name(s) could not be resolved", output.results.len());
            }
        }
        Commands::Inspect { file } => {
            let result = inspect(&config, &file)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn open_session(cli: &Cli, config: &EnhanceConfig) -> Result<EnhanceSession> {
    let ledger_path = resolve_ledger_path(cli, config)?;
    EnhanceSession::from_config(config, &EnhancerRegistry::with_builtins(), ledger_path)
}

fn require_ledger(cli: &Cli, config: &EnhanceConfig) -> Result<PathBuf> {
    resolve_ledger_path(cli, config)?.context("The ledger is disabled (--no-ledger)")
}

#[derive(Debug, Serialize)]
struct ClearResult {
    cleared: String,
}

#[derive(Debug, Serialize)]
struct ResolveResult {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    class: Option<DefinedClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResolveOutput {
    source: String,
    duration_ms: u64,
    results: Vec<ResolveResult>,
}

fn resolve_names(session: &EnhanceSession, names: &[String]) -> ResolveOutput {
    let start = Instant::now();
    let loader = session.loader(Arc::new(session.classpath()));
    let results = names
        .iter()
        .map(|name| match loader.resolve(name) {
            Ok(class) => ResolveResult {
                name: name.clone(),
                class: Some(class),
                error: None,
            },
            Err(err) => ResolveResult {
                name: name.clone(),
                class: None,
                error: Some(format!("{:#}", anyhow::Error::new(err))),
            },
        })
        .collect();
    ResolveOutput {
        source: session.config().source.to_string_lossy().to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        results,
    }
}

#[derive(Debug, Serialize)]
struct InspectResult {
    file: String,
    name: String,
    major_version: u16,
    minor_version: u16,
    access_flags: u16,
    super_class: Option<String>,
    interfaces: Vec<String>,
    fields: u16,
    methods: u16,
    attributes: Vec<String>,
    marker: Option<MarkerRecord>,
    verdict: Verdict,
}

fn inspect(config: &EnhanceConfig, file: &Path) -> Result<InspectResult> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read class file: {}", file.display()))?;
    let class = ClassFile::parse(&bytes).with_context(|| format!("Not a class file: {}", file.display()))?;
    let name = class.qualified_name();

    let expected = config.enhancers.iter().map(|spec| spec.id()).collect();
    let filter = EligibilityFilter::new(config.platform_prefixes.clone(), expected);
    let descriptor = UnitDescriptor::new(&name, UnitLocation::in_place(file.to_path_buf()), bytes);
    let verdict = filter.classify(&descriptor)?;

    Ok(InspectResult {
        file: file.to_string_lossy().to_string(),
        major_version: class.major_version,
        minor_version: class.minor_version,
        access_flags: class.access_flags,
        super_class: class.super_class.as_deref().map(internal_to_qualified),
        interfaces: class.interfaces.iter().map(|i| internal_to_qualified(i)).collect(),
        fields: class.field_count,
        methods: class.method_count,
        attributes: class.attributes.iter().map(|a| a.name.clone()).collect(),
        marker: marker::read(&class),
        verdict,
        name,
    })
}
