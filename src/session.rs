//! One configured run: config in, processor plus batch driver or loader out.
//!
//! Everything a run needs (chain, filter, ledger) is built here once and
//! passed down by reference; nothing is process-global.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::classpath::{Classpath, ParentResolver};
use crate::config::EnhanceConfig;
use crate::eligibility::EligibilityFilter;
use crate::enhancer::EnhancementSink;
use crate::ledger::Ledger;
use crate::loader::ReloadingLoader;
use crate::pipeline::{BatchEnhancer, BatchReport, UnitProcessor};
use crate::registry::EnhancerRegistry;

pub struct EnhanceSession {
    config: EnhanceConfig,
    processor: Arc<UnitProcessor>,
}

impl EnhanceSession {
    /// Builds the chain from `config.enhancers`. A ledger that cannot be
    /// opened is reported and the run continues without one.
    pub fn from_config(
        config: &EnhanceConfig,
        registry: &EnhancerRegistry,
        ledger_path: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let chain = registry
            .build_chain(&config.enhancers)
            .context("Invalid enhancer registration list")?;
        if chain.is_empty() {
            warn!("no enhancers configured; eligible units will only be marked");
        }
        info!(enhancers = ?chain, "enhancer chain ready");
        let ledger = ledger_path.and_then(|path| match Ledger::open(path.clone()) {
            Ok(ledger) => Some(Arc::new(ledger)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ledger unavailable, continuing without it");
                None
            }
        });
        Ok(Self::with_sink(config.clone(), Arc::new(chain), ledger))
    }

    /// For embedders supplying their own sink instead of a configured chain.
    pub fn with_sink(config: EnhanceConfig, sink: Arc<dyn EnhancementSink>, ledger: Option<Arc<Ledger>>) -> Self {
        let filter = EligibilityFilter::new(config.platform_prefixes.clone(), sink.enhancer_ids());
        let processor = Arc::new(UnitProcessor::new(filter, sink).with_ledger(ledger));
        Self { config, processor }
    }

    pub fn config(&self) -> &EnhanceConfig {
        &self.config
    }

    pub fn processor(&self) -> &Arc<UnitProcessor> {
        &self.processor
    }

    pub fn batch(&self) -> BatchEnhancer {
        BatchEnhancer::new(Arc::clone(&self.processor))
            .with_destination(self.config.destination.clone())
            .with_parallel(self.config.parallel)
    }

    pub fn run_batch(&self) -> Result<BatchReport> {
        let report = self
            .batch()
            .run(&self.config.source, self.config.recursive)
            .with_context(|| format!("Failed to walk class root: {}", self.config.source.display()))?;
        Ok(report)
    }

    /// The configured classpath, used as the loader's parent by default.
    pub fn classpath(&self) -> Classpath {
        Classpath::new(self.config.classpath.clone())
    }

    pub fn loader(&self, parent: Arc<dyn ParentResolver>) -> ReloadingLoader {
        ReloadingLoader::new(
            self.config.source.clone(),
            self.config.destination.clone(),
            Arc::clone(&self.processor),
            parent,
        )
    }
}
