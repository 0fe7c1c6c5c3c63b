use serde::{Deserialize, Serialize};

use crate::types::{Batch, WorkItem};

/// Output of a [`BatchPlanner`]: disjoint batches plus items that run alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannedWork {
    pub batches: Vec<Batch>,
    pub individual: Vec<WorkItem>,
}

impl PlannedWork {
    pub fn item_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum::<usize>() + self.individual.len()
    }
}

/// Decides which items share an oracle call.
pub trait BatchPlanner: Send + Sync {
    fn plan(&self, items: Vec<WorkItem>) -> PlannedWork;
}

/// Groups items by source identity, in input order, under item-count and cost
/// ceilings.
///
/// Items costing more than `max_item_cost` always run individually, as do
/// groups that end up smaller than `min_batch_items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPlanner {
    pub max_item_cost: u64,
    pub max_batch_items: usize,
    pub max_batch_cost: u64,
    pub min_batch_items: usize,
}

impl Default for ThresholdPlanner {
    fn default() -> Self {
        Self {
            max_item_cost: 8 * 1024,
            max_batch_items: 8,
            max_batch_cost: 32 * 1024,
            min_batch_items: 2,
        }
    }
}

impl ThresholdPlanner {
    pub fn with_max_batch_items(mut self, n: usize) -> Self {
        self.max_batch_items = n.max(1);
        self
    }

    pub fn with_max_item_cost(mut self, cost: u64) -> Self {
        self.max_item_cost = cost;
        self
    }

    pub fn with_max_batch_cost(mut self, cost: u64) -> Self {
        self.max_batch_cost = cost;
        self
    }

    pub fn with_min_batch_items(mut self, n: usize) -> Self {
        self.min_batch_items = n.max(1);
        self
    }

    fn flush(&self, group: &mut Vec<WorkItem>, out: &mut PlannedWork) {
        if group.is_empty() {
            return;
        }
        let group = std::mem::take(group);
        if group.len() < self.min_batch_items.max(1) {
            out.individual.extend(group);
            return;
        }
        let id = format!("batch-{}", out.batches.len() + 1);
        out.batches.push(Batch::new(id, group));
    }
}

impl BatchPlanner for ThresholdPlanner {
    fn plan(&self, items: Vec<WorkItem>) -> PlannedWork {
        let mut out = PlannedWork::default();
        // (source identity, members), first-seen order
        let mut groups: Vec<(String, Vec<WorkItem>)> = Vec::new();
        for item in items {
            if item.estimated_cost > self.max_item_cost {
                out.individual.push(item);
                continue;
            }
            match groups
                .iter_mut()
                .find(|(source, _)| *source == item.source_identity)
            {
                Some((_, members)) => members.push(item),
                None => groups.push((item.source_identity.clone(), vec![item])),
            }
        }

        let max_items = self.max_batch_items.max(1);
        for (_, members) in groups {
            let mut current: Vec<WorkItem> = Vec::new();
            let mut cost = 0u64;
            for item in members {
                let over_items = current.len() >= max_items;
                let over_cost = !current.is_empty()
                    && cost.saturating_add(item.estimated_cost) > self.max_batch_cost;
                if over_items || over_cost {
                    self.flush(&mut current, &mut out);
                    cost = 0;
                }
                cost = cost.saturating_add(item.estimated_cost);
                current.push(item);
            }
            self.flush(&mut current, &mut out);
        }
        tracing::debug!(
            batches = out.batches.len(),
            individual = out.individual.len(),
            "threshold planner grouped work"
        );
        out
    }
}
