//! Merging reprocessed part results into a held search result.

use serde::Serialize;
use tracing::warn;

use crate::backend::{PartResult, ReprocessStrategy, SearchResult};

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Part numbers whose entries were replaced, in response order.
    pub replaced: Vec<String>,
    /// Returned part numbers that were not requested or not held; ignored.
    pub unmatched: Vec<String>,
}

/// Replace the entries for `requested` parts with `fresh` results, in place.
///
/// Positions and cardinality of `result.results` never change. Entries that
/// were not requested keep their content and annotations. Replacements are
/// annotated with `strategy`.
pub fn merge_reprocessed(
    result: &mut SearchResult,
    requested: &[String],
    fresh: Vec<PartResult>,
    strategy: ReprocessStrategy,
) -> MergeReport {
    let mut report = MergeReport::default();

    for mut part in fresh {
        let slot = if requested.iter().any(|p| *p == part.part_number) {
            result
                .results
                .iter_mut()
                .find(|held| held.part_number == part.part_number)
        } else {
            None
        };

        match slot {
            Some(slot) => {
                part.strategy = Some(strategy);
                report.replaced.push(part.part_number.clone());
                *slot = part;
            }
            None => {
                warn!(
                    search_id = %result.search_id,
                    part_number = %part.part_number,
                    "Reprocess returned a part that was not requested; ignoring it"
                );
                report.unmatched.push(part.part_number);
            }
        }
    }

    report
}
