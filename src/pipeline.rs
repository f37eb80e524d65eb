//! The descriptor's progress lock is held from the eligibility check until the
//! enhanced bytes are committed; a second caller for the same unit waits on it
//! and reads the settled outcome.

use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::DescriptorCache;
use crate::commit::{CommitReceipt, Committer};
use crate::descriptor::{EnhancementState, ProgressGuard, UnitDescriptor, UnitLocation};
use crate::eligibility::{EligibilityFilter, SkipReason};
use crate::enhancer::EnhancementSink;
use crate::error::{StateError, StructuralError};
use crate::ledger::{Ledger, LedgerRow};
use crate::marker::sha256_hex;
use crate::scan::{self, ScannedUnit};

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub state: EnhancementState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhancer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed: Option<CommitReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
}

impl UnitReport {
    fn settled(unit: &ProgressGuard<'_>) -> Self {
        Self {
            unit: unit.qualified_name().to_string(),
            state: unit.state(),
            skip_reason: unit.skip_reason().cloned(),
            enhancer: None,
            failure: unit.failure().map(str::to_string),
            committed: None,
            persistence_error: None,
        }
    }
}

pub struct UnitProcessor {
    filter: EligibilityFilter,
    sink: Arc<dyn EnhancementSink>,
    committer: Committer,
    ledger: Option<Arc<Ledger>>,
}

impl UnitProcessor {
    pub fn new(filter: EligibilityFilter, sink: Arc<dyn EnhancementSink>) -> Self {
        Self {
            filter,
            sink,
            committer: Committer::new(),
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Option<Arc<Ledger>>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn filter(&self) -> &EligibilityFilter {
        &self.filter
    }

    /// Classify, enhance and commit one unit. Returns the settled outcome
    /// without doing any work if the unit already reached a terminal state.
    pub fn process(&self, descriptor: &UnitDescriptor) -> UnitReport {
        let mut unit = descriptor.lock();
        if unit.state().is_terminal() {
            return UnitReport::settled(&unit);
        }
        let name = unit.qualified_name();

        let verdict = match self.filter.classify(descriptor) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(unit = name, error = %err, "malformed class file");
                log_state_error(unit.fail(format!("malformed class file: {err}")));
                return UnitReport::settled(&unit);
            }
        };
        if let Some(reason) = SkipReason::from_verdict(&verdict) {
            debug!(unit = name, reason = ?reason, "skipped");
            log_state_error(unit.skip(reason));
            return UnitReport::settled(&unit);
        }

        if let Err(err) = unit.advance(EnhancementState::InProgress) {
            log_state_error(Err(err));
            return UnitReport::settled(&unit);
        }
        let start = Instant::now();
        if let Err(err) = self.sink.enhance(&mut unit) {
            let enhancer = err.enhancer.to_string();
            let cause = format!("{:#}", anyhow::Error::new(err));
            error!(unit = name, enhancer = %enhancer, error = %cause, "enhancement failed");
            log_state_error(unit.fail(cause));
            let mut report = UnitReport::settled(&unit);
            report.enhancer = Some(enhancer);
            return report;
        }
        log_state_error(unit.advance(EnhancementState::Enhanced));
        info!(
            unit = name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "enhanced"
        );

        let mut report = UnitReport::settled(&unit);
        match self.committer.commit(&unit) {
            Ok(receipt) => {
                if let Some(receipt) = receipt.as_ref() {
                    self.record(&unit, receipt);
                }
                report.committed = receipt;
            }
            Err(err) => {
                let message = format!("{:#}", anyhow::Error::new(err));
                warn!(unit = name, error = %message, "write-back failed");
                report.persistence_error = Some(message);
            }
        }
        report
    }

    fn record(&self, unit: &ProgressGuard<'_>, receipt: &CommitReceipt) {
        let Some(ledger) = self.ledger.as_ref() else {
            return;
        };
        let row = LedgerRow::now(
            unit.qualified_name(),
            sha256_hex(unit.original()),
            receipt.sha256.clone(),
            self.sink
                .enhancer_ids()
                .iter()
                .map(ToString::to_string)
                .collect(),
        );
        if let Err(err) = ledger.record(&receipt.path, &row) {
            warn!(unit = unit.qualified_name(), error = %err, "failed to update ledger");
        }
    }
}

fn log_state_error(result: Result<(), StateError>) {
    if let Err(err) = result {
        error!(unit = %err.unit, error = %err, "descriptor state machine violated");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StructuralIssue {
    pub path: String,
    pub message: String,
}

impl From<&StructuralError> for StructuralIssue {
    fn from(err: &StructuralError) -> Self {
        Self {
            path: err.path().to_string_lossy().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub root: String,
    pub destination: String,
    pub enhanced: usize,
    pub skipped: usize,
    pub failed: usize,
    pub persistence_errors: usize,
    pub units: Vec<UnitReport>,
    pub structural_errors: Vec<StructuralIssue>,
    pub misplaced_sources: Vec<String>,
    pub abandoned: usize,
    pub elapsed_ms: u64,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.persistence_errors > 0 || !self.structural_errors.is_empty()
    }

    pub fn unit(&self, qualified_name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.unit == qualified_name)
    }
}

pub struct BatchEnhancer {
    processor: Arc<UnitProcessor>,
    cache: Arc<DescriptorCache>,
    destination: Option<PathBuf>,
    parallel: bool,
}

impl BatchEnhancer {
    pub fn new(processor: Arc<UnitProcessor>) -> Self {
        Self {
            processor,
            cache: Arc::new(DescriptorCache::new()),
            destination: None,
            parallel: false,
        }
    }

    pub fn with_destination(mut self, destination: Option<PathBuf>) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_cache(mut self, cache: Arc<DescriptorCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<DescriptorCache> {
        &self.cache
    }

    pub fn run(&self, root: &Path, recursive: bool) -> Result<BatchReport, StructuralError> {
        let start = Instant::now();
        let scan = scan::walk(root, recursive)?;
        info!(root = %root.display(), units = scan.units.len(), "scanned class tree");

        let units: Vec<UnitReport> = if self.parallel {
            // rayon workers do not inherit the caller's scoped subscriber
            let dispatch = tracing::dispatcher::get_default(|d| d.clone());
            scan.units
                .into_par_iter()
                .map(|u| tracing::dispatcher::with_default(&dispatch, || self.process_scanned(u)))
                .collect()
        } else {
            scan.units.into_iter().map(|u| self.process_scanned(u)).collect()
        };

        let count = |state: EnhancementState| units.iter().filter(|u| u.state == state).count();
        let report = BatchReport {
            root: root.to_string_lossy().to_string(),
            destination: self
                .destination
                .as_deref()
                .unwrap_or(root)
                .to_string_lossy()
                .to_string(),
            enhanced: count(EnhancementState::Enhanced),
            skipped: count(EnhancementState::Skipped),
            failed: count(EnhancementState::Failed),
            persistence_errors: units.iter().filter(|u| u.persistence_error.is_some()).count(),
            structural_errors: scan.errors.iter().map(StructuralIssue::from).collect(),
            misplaced_sources: scan
                .misplaced_sources
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect(),
            abandoned: scan.abandoned,
            elapsed_ms: start.elapsed().as_millis() as u64,
            units,
        };
        info!(
            enhanced = report.enhanced,
            skipped = report.skipped,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "batch finished"
        );
        Ok(report)
    }

    fn process_scanned(&self, unit: ScannedUnit) -> UnitReport {
        let qualified_name = unit.qualified_name();
        let location = match self.destination.as_ref() {
            Some(dest) => UnitLocation {
                output: dest.join(&unit.relative_path),
                source: unit.path,
            },
            None => UnitLocation::in_place(unit.path),
        };
        let bytes = unit.bytes;
        let descriptor = match self
            .cache
            .get_or_create(&qualified_name, || {
                Ok::<_, std::convert::Infallible>(UnitDescriptor::new(&qualified_name, location, bytes))
            }) {
            Ok(descriptor) => descriptor,
            Err(never) => match never {},
        };
        self.processor.process(&descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ClassFile, access, skeleton};
    use crate::enhancer::tests::{Failing, Recording};
    use crate::enhancer::{Enhancer, EnhancerChain, EnhancerId};
    use crate::eligibility::{ExemptReason, PriorEnhancement};
    use crate::marker::{self, MarkerRecord};
    use std::sync::atomic::Ordering;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "class_enhancer_pipeline_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write(root: &Path, relative: &str, bytes: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn processor(chain: EnhancerChain) -> Arc<UnitProcessor> {
        let filter = EligibilityFilter::new(Vec::new(), chain.ids());
        Arc::new(UnitProcessor::new(filter, Arc::new(chain)))
    }

    fn marked(internal: &str) -> Vec<u8> {
        let bytes = skeleton(internal, Some("java/lang/Object"), access::PUBLIC);
        let record = MarkerRecord {
            enhancers: vec![EnhancerId::new("A", "1")],
            source_sha256: None,
        };
        marker::stamp(&bytes, &record).unwrap()
    }

    struct SampleTree {
        root: PathBuf,
        foo: Vec<u8>,
        untouched: Vec<(&'static str, Vec<u8>)>,
    }

    fn sample_tree(name: &str) -> SampleTree {
        let root = temp_dir(name);
        let foo = skeleton("a/Foo", Some("java/lang/Object"), access::PUBLIC | access::SUPER);
        let untouched = vec![
            (
                "a/Bar.class",
                skeleton("a/Bar", Some("java/lang/Object"), access::PUBLIC | access::INTERFACE | access::ABSTRACT),
            ),
            (
                "a/Color.class",
                skeleton("a/Color", Some("java/lang/Enum"), access::PUBLIC | access::FINAL | access::SUPER | access::ENUM),
            ),
            (
                "a/Tag.class",
                skeleton(
                    "a/Tag",
                    Some("java/lang/Object"),
                    access::PUBLIC | access::INTERFACE | access::ABSTRACT | access::ANNOTATION,
                ),
            ),
            ("b/Baz.class", marked("b/Baz")),
            (
                "java/util/Widget.class",
                skeleton("java/util/Widget", Some("java/lang/Object"), access::PUBLIC),
            ),
        ];
        write(&root, "a/Foo.class", &foo);
        for (relative, bytes) in &untouched {
            write(&root, relative, bytes);
        }
        SampleTree { root, foo, untouched }
    }

    #[test]
    fn batch_end_to_end() -> anyhow::Result<()> {
        let tree = sample_tree("e2e");
        let root = &tree.root;
        let pass = Recording::new("A");
        let chain = EnhancerChain::new(vec![pass.clone() as Arc<dyn Enhancer>]);
        let report = BatchEnhancer::new(processor(chain)).run(root, true)?;

        assert_eq!((report.enhanced, report.skipped, report.failed), (1, 5, 0));
        assert_eq!(report.unit("a.Foo").map(|u| u.state), Some(EnhancementState::Enhanced));
        let reason = |name: &str| report.unit(name).and_then(|u| u.skip_reason.clone());
        assert_eq!(reason("a.Bar"), Some(SkipReason::Exempt(ExemptReason::Interface)));
        assert_eq!(reason("a.Color"), Some(SkipReason::Exempt(ExemptReason::Enum)));
        assert_eq!(reason("a.Tag"), Some(SkipReason::Exempt(ExemptReason::Annotation)));
        assert_eq!(
            reason("b.Baz"),
            Some(SkipReason::AlreadyEnhanced(PriorEnhancement::Marker))
        );
        assert_eq!(
            reason("java.util.Widget"),
            Some(SkipReason::Exempt(ExemptReason::Platform {
                prefix: "java.".to_string()
            }))
        );

        let foo_after = std::fs::read(root.join("a/Foo.class"))?;
        assert_ne!(foo_after, tree.foo);
        assert!(marker::is_marked(&ClassFile::parse(&foo_after)?));
        for (relative, bytes) in &tree.untouched {
            assert_eq!(&std::fs::read(root.join(relative))?, bytes, "{relative} was rewritten");
        }
        assert_eq!(pass.calls.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[test]
    fn second_run_is_a_no_op() -> anyhow::Result<()> {
        let root = sample_tree("idempotent").root;
        let pass = Recording::new("A");
        let chain = EnhancerChain::new(vec![pass.clone() as Arc<dyn Enhancer>]);
        BatchEnhancer::new(processor(chain.clone())).run(&root, true)?;
        let first = std::fs::read(root.join("a/Foo.class"))?;

        let report = BatchEnhancer::new(processor(chain)).run(&root, true)?;
        assert_eq!(report.enhanced, 0);
        assert_eq!(report.skipped, 6);
        assert_eq!(std::fs::read(root.join("a/Foo.class"))?, first);
        assert_eq!(pass.calls.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[test]
    fn failing_unit_does_not_stop_the_rest() -> anyhow::Result<()> {
        let root = temp_dir("isolation");
        for name in ["a/A1", "a/A2", "a/A3"] {
            write(&root, &format!("{name}.class"), &skeleton(name, Some("java/lang/Object"), access::PUBLIC));
        }
        write(&root, "a/Broken.class", b"\xCA\xFE\xBA\xBEtruncated");

        let chain = EnhancerChain::new(vec![Arc::new(Failing(EnhancerId::new("boom", "1"))) as Arc<dyn Enhancer>]);
        let report = BatchEnhancer::new(processor(chain)).run(&root, true)?;
        assert_eq!(report.failed, 4);
        assert!(report.units.iter().all(|u| u.state.is_terminal()));
        assert_eq!(report.unit("a.A2").and_then(|u| u.enhancer.clone()).as_deref(), Some("boom@1"));
        assert!(report.unit("a.Broken").and_then(|u| u.failure.clone()).is_some_and(|f| f.contains("malformed")));
        assert!(report.has_failures());

        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[test]
    fn destination_tree_receives_output_and_stale_copies_are_redone() -> anyhow::Result<()> {
        let root = temp_dir("dest_src");
        let dest = temp_dir("dest_out");
        let foo = skeleton("a/Foo", Some("java/lang/Object"), access::PUBLIC);
        write(&root, "a/Foo.class", &foo);

        let pass = Recording::new("A");
        let chain = EnhancerChain::new(vec![pass.clone() as Arc<dyn Enhancer>]);
        let run = |chain: EnhancerChain| {
            BatchEnhancer::new(processor(chain))
                .with_destination(Some(dest.clone()))
                .run(&root, true)
        };

        assert_eq!(run(chain.clone())?.enhanced, 1);
        assert_eq!(std::fs::read(root.join("a/Foo.class"))?, foo);
        assert!(dest.join("a/Foo.class").exists());

        let again = run(chain.clone())?;
        assert_eq!(
            again.unit("a.Foo").and_then(|u| u.skip_reason.clone()),
            Some(SkipReason::AlreadyEnhanced(PriorEnhancement::OutputCopy))
        );

        let recompiled = skeleton("a/Foo", Some("a/Base"), access::PUBLIC);
        write(&root, "a/Foo.class", &recompiled);
        assert_eq!(run(chain)?.enhanced, 1);
        assert_eq!(pass.calls.load(Ordering::SeqCst), 2);

        let _ = std::fs::remove_dir_all(root);
        let _ = std::fs::remove_dir_all(dest);
        Ok(())
    }

    #[test]
    fn parallel_batch_matches_sequential() -> anyhow::Result<()> {
        let root = temp_dir("parallel");
        for i in 0..24 {
            let name = format!("p/C{i}");
            write(&root, &format!("{name}.class"), &skeleton(&name, Some("java/lang/Object"), access::PUBLIC));
        }
        let pass = Recording::new("A");
        let chain = EnhancerChain::new(vec![pass.clone() as Arc<dyn Enhancer>]);
        let report = BatchEnhancer::new(processor(chain))
            .with_parallel(true)
            .run(&root, true)?;
        assert_eq!(report.enhanced, 24);
        assert_eq!(pass.calls.load(Ordering::SeqCst), 24);

        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[test]
    fn processing_a_settled_unit_is_a_no_op() {
        let pass = Recording::new("A");
        let processor = processor(EnhancerChain::new(vec![pass.clone() as Arc<dyn Enhancer>]));
        let root = temp_dir("settled");
        let d = UnitDescriptor::new(
            "a.Foo",
            UnitLocation::in_place(root.join("a/Foo.class")),
            skeleton("a/Foo", Some("java/lang/Object"), access::PUBLIC),
        );
        let first = processor.process(&d);
        let second = processor.process(&d);
        assert_eq!(first.state, EnhancementState::Enhanced);
        assert!(first.committed.is_some());
        assert_eq!(second.state, EnhancementState::Enhanced);
        assert!(second.committed.is_none());
        assert_eq!(pass.calls.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn missing_root_is_structural() {
        let chain = EnhancerChain::default();
        let err = BatchEnhancer::new(processor(chain))
            .run(&temp_dir("absent"), true)
            .unwrap_err();
        assert!(matches!(err, StructuralError::MissingRoot { .. }));
    }
}
