//! Pure confidence scoring over an evidence set.
//!
//! Nothing here reads the clock or mutates input, so the same evidence slice
//! always produces the same score.

use std::collections::{BTreeMap, BTreeSet};

use dossier_model::EvidenceID;

use crate::error::{InvestigationError, Result};
use crate::record::{Evidence, InvestigationRecord};

/// reliability × relevance, normalized to [0, 1].
pub fn evidence_weight(evidence: &Evidence) -> f64 {
    let reliability = f64::from(evidence.reliability.min(100)) / 100.0;
    let relevance = f64::from(evidence.relevance.min(100)) / 100.0;
    reliability * relevance
}

/// Confidence contributed by a single item. Equal to its weight.
pub fn evidence_confidence(evidence: &Evidence) -> f64 {
    evidence_weight(evidence)
}

/// Weighted average confidence over non-superseded evidence, clamped to
/// [0, 1]. An empty or zero-weight set scores 0.
pub fn score(evidence: &[Evidence]) -> f64 {
    let superseded: BTreeSet<EvidenceID> =
        evidence.iter().filter_map(|e| e.supersedes).collect();

    let mut ordered: Vec<&Evidence> = evidence
        .iter()
        .filter(|e| !superseded.contains(&e.id))
        .collect();
    ordered.sort_by_key(|e| e.sequence);

    let (weighted, total) = ordered.iter().fold((0.0f64, 0.0f64), |(num, den), e| {
        let w = evidence_weight(e);
        (num + w * evidence_confidence(e), den + w)
    });

    if total <= 0.0 {
        return 0.0;
    }
    (weighted / total).clamp(0.0, 1.0)
}

/// Maps every superseded id to the head of its correction chain.
///
/// When several items supersede the same record the one ingested last wins.
pub fn supersession_heads(evidence: &[Evidence]) -> BTreeMap<EvidenceID, EvidenceID> {
    let mut ordered: Vec<&Evidence> = evidence.iter().collect();
    ordered.sort_by_key(|e| e.sequence);

    let mut next: BTreeMap<EvidenceID, EvidenceID> = BTreeMap::new();
    for e in ordered {
        if let Some(old) = e.supersedes {
            next.insert(old, e.id);
        }
    }

    let mut heads = BTreeMap::new();
    for start in next.keys() {
        let mut current = *start;
        let mut seen = BTreeSet::from([current]);
        while let Some(follow) = next.get(&current) {
            if !seen.insert(*follow) {
                break;
            }
            current = *follow;
        }
        heads.insert(*start, current);
    }
    heads
}

/// Confidence of a derived record: the mean confidence of its cited
/// evidence after resolving supersession, capped at the most confident item
/// the record literally cites. A correction can lower a derived record but
/// never lift it above its own sources.
pub fn derived_confidence(cites: &[EvidenceID], evidence: &[Evidence]) -> Result<f64> {
    if cites.is_empty() {
        return Ok(0.0);
    }

    let heads = supersession_heads(evidence);
    let by_id: BTreeMap<EvidenceID, &Evidence> = evidence.iter().map(|e| (e.id, e)).collect();

    let mut resolved = BTreeSet::new();
    let mut max = 0.0f64;
    for cite in cites {
        let Some(cited) = by_id.get(cite) else {
            return Err(InvestigationError::ConsistencyViolation(format!(
                "derived record cites unknown evidence {cite}"
            )));
        };
        max = max.max(evidence_confidence(cited));
        resolved.insert(heads.get(cite).copied().unwrap_or(*cite));
    }

    let confidences: Vec<f64> = resolved
        .iter()
        .filter_map(|id| by_id.get(id))
        .map(|e| evidence_confidence(e))
        .collect();
    let mean = (confidences.iter().sum::<f64>() / confidences.len() as f64).min(max);

    if !(0.0..=1.0).contains(&mean) {
        return Err(InvestigationError::ConsistencyViolation(format!(
            "derived confidence {mean} outside [0, 1] (cited maximum {max})"
        )));
    }
    Ok(mean)
}

/// Satisfied collection requirements over all requirements. 1.0 when no
/// target declares any.
pub fn completeness(record: &InvestigationRecord) -> f64 {
    let mut total = 0usize;
    let mut satisfied = 0usize;
    for target in record.targets.values() {
        for cap in &target.requirements {
            total += 1;
            if record.requirement_satisfied(target.id, cap) {
                satisfied += 1;
            }
        }
    }
    if total == 0 {
        1.0
    } else {
        satisfied as f64 / total as f64
    }
}

/// Recomputes every score on the record from its full evidence set.
pub fn rescore(record: &mut InvestigationRecord) -> Result<()> {
    record.confidence = score(&record.evidence);
    record.completeness = completeness(record);

    let evidence = &record.evidence;
    for finding in record.findings.iter_mut() {
        finding.confidence = derived_confidence(&finding.cites, evidence)?;
    }
    for assessment in record.assessments.iter_mut() {
        assessment.confidence = derived_confidence(&assessment.cites, evidence)?;
    }
    Ok(())
}
