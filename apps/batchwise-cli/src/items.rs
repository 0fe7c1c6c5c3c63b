use std::path::Path;

use anyhow::{bail, Context, Result};
use batchwise_core::WorkItem;
use serde::Deserialize;
use serde_json::Value;

/// One record of an items file.
#[derive(Debug, Deserialize)]
struct ItemRecord {
    id: String,
    #[serde(alias = "source_identity")]
    source: String,
    payload: Value,
    #[serde(default, alias = "content_fingerprint")]
    fingerprint: Option<String>,
    #[serde(default, alias = "estimated_cost")]
    cost: Option<u64>,
}

impl From<ItemRecord> for WorkItem {
    fn from(record: ItemRecord) -> Self {
        let mut item = WorkItem::new(record.id, record.source, record.payload);
        if let Some(fp) = record.fingerprint {
            item = item.with_fingerprint(fp);
        }
        if let Some(cost) = record.cost {
            item = item.with_cost(cost);
        }
        item
    }
}

/// Read work items from a JSON array or from JSON lines.
pub fn load_items(path: &Path) -> Result<Vec<WorkItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading items from {}", path.display()))?;
    let records: Vec<ItemRecord> = if text.trim_start().starts_with('[') {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parsing {} line {}", path.display(), idx + 1))
            })
            .collect::<Result<_>>()?
    };
    let mut seen = std::collections::HashSet::new();
    for record in &records {
        if !seen.insert(record.id.as_str()) {
            bail!("duplicate item id '{}' in {}", record.id, path.display());
        }
    }
    Ok(records.into_iter().map(WorkItem::from).collect())
}
