use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::admin::Result;
use crate::storage::{CompactionPhase, DeltaSlot, HybridStore};
use crate::types::TriplePattern;

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Manifest and file checks only.
    Fast,
    /// Also scans the merged view and checks it against the counters.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating corruption or a broken invariant.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Statistics collected during verification.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Triples yielded by a full scan.
    pub scanned: u64,
    /// Logical count reported by the store.
    pub logical: u64,
    /// Tombstoned snapshot triples.
    pub tombstones: u64,
    /// Triples held by the delta slots.
    pub delta: u64,
}

/// Complete report of a verification run.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification found no errors.
    pub success: bool,
    /// Issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Counters examined.
    pub counts: VerifyCounts,
}

/// Verifies an open store.
///
/// `Fast` checks that every file the manifest names exists and that the
/// counters are in range. `Full` additionally scans the merged view and
/// checks that no triple is yielded twice (the snapshot's live set and the
/// delta slots are disjoint) and that the scan agrees with `len()`.
///
/// # Errors
///
/// Returns an error only if the store cannot be read at all; individual
/// problems are reported as findings.
pub fn verify(store: &HybridStore, level: VerifyLevel) -> Result<VerifyReport> {
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();
    let manifest = store.manifest();
    let layout = store.layout();
    let stats = store.stats();

    let mut expected = vec![layout.snapshot(manifest.epoch), layout.tombstones(manifest.epoch)];
    for slot in DeltaSlot::BOTH {
        expected.push(layout.delta(slot, manifest.delta_generations[slot]));
    }
    for path in expected {
        if !path.exists() {
            push(
                &mut findings,
                VerifyFinding::error(format!("manifest references missing file {}", path.display())),
            );
        }
    }
    if manifest.epoch != stats.epoch {
        push(
            &mut findings,
            VerifyFinding::error(format!(
                "manifest epoch {} differs from installed epoch {}",
                manifest.epoch, stats.epoch
            )),
        );
    }
    if stats.phase != CompactionPhase::Idle {
        push(
            &mut findings,
            VerifyFinding::warning(format!("compaction in progress ({})", stats.phase)),
        );
    }
    if stats.tombstones > stats.snapshot_triples {
        push(
            &mut findings,
            VerifyFinding::error(format!(
                "{} tombstones for {} snapshot triples",
                stats.tombstones, stats.snapshot_triples
            )),
        );
    }
    let encodings = store.delta_encoding_epochs();
    for slot in DeltaSlot::BOTH {
        if encodings[slot] != stats.epoch && stats.frozen != Some(slot) {
            push(
                &mut findings,
                VerifyFinding::error(format!(
                    "delta slot {} encoded against epoch {} but epoch {} is installed",
                    slot.label(),
                    encodings[slot],
                    stats.epoch
                )),
            );
        }
    }
    counts.logical = stats.logical_triples;
    counts.tombstones = stats.tombstones;
    counts.delta = stats.delta_triples.a + stats.delta_triples.b;

    if matches!(level, VerifyLevel::Full) {
        scan_merged_view(store, &mut findings, &mut counts);
    }

    Ok(VerifyReport {
        level,
        success: findings
            .iter()
            .all(|finding| finding.severity != VerifySeverity::Error),
        findings,
        counts,
    })
}

fn scan_merged_view(store: &HybridStore, findings: &mut Vec<VerifyFinding>, counts: &mut VerifyCounts) {
    let iter = match store.lookup(&TriplePattern::any()) {
        Ok(iter) => iter,
        Err(err) => {
            push(findings, VerifyFinding::error(format!("full scan failed: {err}")));
            return;
        }
    };
    let mut seen = FxHashSet::default();
    for item in iter {
        match item {
            Ok(triple) => {
                counts.scanned += 1;
                if !seen.insert(triple.clone()) {
                    push(
                        findings,
                        VerifyFinding::error(format!("triple yielded twice: {triple}")),
                    );
                }
            }
            Err(err) => push(findings, VerifyFinding::error(format!("scan error: {err}"))),
        }
    }
    if counts.scanned != counts.logical {
        push(
            findings,
            VerifyFinding::error(format!(
                "full scan yielded {} triples but the store counts {}",
                counts.scanned, counts.logical
            )),
        );
    }
}

fn push(findings: &mut Vec<VerifyFinding>, finding: VerifyFinding) {
    if findings.len() < MAX_FINDINGS {
        findings.push(finding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{open_store, AdminOpenOptions};
    use crate::error::StoreError;
    use crate::types::Triple;

    fn triple(s: &str, o: &str) -> Triple {
        Triple::parse_line(&format!("<http://example.org/{s}> <http://example.org/p> \"{o}\" ."))
            .expect("valid triple")
    }

    #[test]
    fn clean_store_passes_full_verification() -> crate::admin::Result<()> {
        let dir = tempfile::tempdir()?;
        let opts = AdminOpenOptions {
            create_if_missing: true,
            ..AdminOpenOptions::default()
        };
        let store = open_store(dir.path(), &opts)?;
        for i in 0..10 {
            store
                .insert(&triple(&format!("s{i}"), "v"))
                .map_err(StoreError::from)?;
        }
        store.delete(&triple("s3", "v")).map_err(StoreError::from)?;
        store.compact_now().map_err(StoreError::from)?;
        store.insert(&triple("s3", "v")).map_err(StoreError::from)?;
        store.delete(&triple("s4", "v")).map_err(StoreError::from)?;

        let report = verify(&store, VerifyLevel::Full)?;
        assert!(report.success, "{:?}", report.findings);
        assert_eq!(report.counts.scanned, 9);
        assert_eq!(report.counts.logical, 9);
        assert_eq!(report.counts.tombstones, 1);
        assert_eq!(report.counts.delta, 1);
        Ok(())
    }

    #[test]
    fn missing_journal_is_reported() -> crate::admin::Result<()> {
        let dir = tempfile::tempdir()?;
        let opts = AdminOpenOptions {
            create_if_missing: true,
            ..AdminOpenOptions::default()
        };
        let store = open_store(dir.path(), &opts)?;
        let manifest = store.manifest();
        let inactive = manifest.active.other();
        std::fs::remove_file(
            store
                .layout()
                .delta(inactive, manifest.delta_generations[inactive]),
        )?;
        let report = verify(&store, VerifyLevel::Fast)?;
        assert!(!report.success);
        assert!(report.findings[0].message.contains("missing file"));
        Ok(())
    }
}
