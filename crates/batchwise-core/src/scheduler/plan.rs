use std::collections::{HashMap, HashSet};

use crate::error::ConfigurationError;
use crate::types::{Batch, WorkItem};

/// A validated unit of execution, already in run order.
#[derive(Debug, Clone)]
pub(crate) enum Unit {
    Batch(Batch),
    Single(WorkItem),
}

impl Unit {
    pub(crate) fn item_count(&self) -> usize {
        match self {
            Unit::Batch(batch) => batch.len(),
            Unit::Single(_) => 1,
        }
    }

    pub(crate) fn item_ids(&self) -> Vec<String> {
        match self {
            Unit::Batch(batch) => batch.items.iter().map(|i| i.id.clone()).collect(),
            Unit::Single(item) => vec![item.id.clone()],
        }
    }
}

/// Check that batches are non-empty, uniquely named and disjoint, then order
/// them: batches by priority (highest first, ties keep input order) followed by
/// singles in input order.
///
/// Singles that also appear in a batch are rejected as overlapping.
pub(crate) fn build_units(
    batches: Vec<Batch>,
    singles: Vec<WorkItem>,
) -> Result<Vec<Unit>, ConfigurationError> {
    let mut batch_ids: HashSet<&str> = HashSet::new();
    let mut owner: HashMap<&str, &str> = HashMap::new();
    for batch in &batches {
        if batch.is_empty() {
            return Err(ConfigurationError::EmptyBatch {
                batch_id: batch.id.clone(),
            });
        }
        if !batch_ids.insert(batch.id.as_str()) {
            return Err(ConfigurationError::DuplicateBatchId {
                batch_id: batch.id.clone(),
            });
        }
        for item in &batch.items {
            if let Some(first) = owner.insert(item.id.as_str(), batch.id.as_str()) {
                return Err(ConfigurationError::OverlappingItem {
                    item_id: item.id.clone(),
                    first: format!("batch '{first}'"),
                    second: format!("batch '{}'", batch.id),
                });
            }
        }
    }
    for item in &singles {
        if let Some(first) = owner.insert(item.id.as_str(), "") {
            let first = if first.is_empty() {
                "singles".to_string()
            } else {
                format!("batch '{first}'")
            };
            return Err(ConfigurationError::OverlappingItem {
                item_id: item.id.clone(),
                first,
                second: "singles".into(),
            });
        }
    }

    let mut ordered = batches;
    // sort_by is stable
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
    let mut units: Vec<Unit> = ordered.into_iter().map(Unit::Batch).collect();
    units.extend(singles.into_iter().map(Unit::Single));
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str) -> WorkItem {
        WorkItem::new(id, format!("src/{id}.rs"), json!(id))
    }

    fn ids(units: &[Unit]) -> Vec<Vec<String>> {
        units.iter().map(Unit::item_ids).collect()
    }

    #[test]
    fn orders_batches_by_priority_then_singles() {
        let units = build_units(
            vec![
                Batch::new("low", vec![item("a")]),
                Batch::new("high", vec![item("b")]).with_priority(5),
                Batch::new("low2", vec![item("c")]),
            ],
            vec![item("d")],
        )
        .unwrap();
        assert_eq!(
            ids(&units),
            vec![
                vec!["b".to_string()],
                vec!["a".to_string()],
                vec!["c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn rejects_empty_batch() {
        let err = build_units(vec![Batch::new("e", vec![])], vec![]).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::EmptyBatch {
                batch_id: "e".into()
            }
        );
    }

    #[test]
    fn rejects_duplicate_batch_ids() {
        let err = build_units(
            vec![
                Batch::new("x", vec![item("a")]),
                Batch::new("x", vec![item("b")]),
            ],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateBatchId { .. }));
    }

    #[test]
    fn rejects_overlap_between_batches_and_singles() {
        let err = build_units(
            vec![
                Batch::new("x", vec![item("a"), item("b")]),
                Batch::new("y", vec![item("b")]),
            ],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::OverlappingItem { ref item_id, .. } if item_id == "b"));

        let err = build_units(vec![Batch::new("x", vec![item("a")])], vec![item("a")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::OverlappingItem { .. }));

        let err = build_units(vec![], vec![item("s"), item("s")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::OverlappingItem { ref first, .. } if first == "singles"));
    }
}
