//! Batch planner: picks the next contiguous slice of the input collection.

use crate::checkpoint::Cursor;
use crate::models::InputItem;

/// Boundaries of one planned batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_index: u64,
    pub start: usize,
    pub end: usize,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Cursor to commit once every item of this batch is settled.
    pub fn completed_cursor(&self) -> Cursor {
        Cursor::new(self.end, self.batch_index + 1)
    }

    /// Artifact file name, unique per boundary.
    pub fn artifact_name(&self) -> String {
        format!("batch_{}-{}.json", self.start, self.end)
    }
}

/// Result of planning.
#[derive(Debug, PartialEq)]
pub enum Plan<'a> {
    /// Items `[start, end)` of the collection
    Slice {
        plan: BatchPlan,
        items: &'a [InputItem],
    },
    /// Nothing left to do. Terminal, not an error.
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    batch_size: usize,
    max_total: Option<usize>,
}

impl BatchPlanner {
    pub fn new(batch_size: usize, max_total: Option<usize>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_total,
        }
    }

    /// Slice `[cursor, min(cursor + batch_size, max_total, len))`.
    pub fn next_slice<'a>(&self, items: &'a [InputItem], cursor: Cursor) -> Plan<'a> {
        let limit = self
            .max_total
            .map_or(items.len(), |cap| cap.min(items.len()));
        let start = cursor.last_index;
        let end = start.saturating_add(self.batch_size).min(limit);

        if start >= end {
            return Plan::Exhausted;
        }

        Plan::Slice {
            plan: BatchPlan {
                batch_index: cursor.batch_index,
                start,
                end,
            },
            items: &items[start..end],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<InputItem> {
        (0..n).map(|i| InputItem::slug(format!("item-{i}"))).collect()
    }

    fn plan_of(plan: Plan<'_>) -> BatchPlan {
        match plan {
            Plan::Slice { plan, items } => {
                assert_eq!(items.len(), plan.len());
                plan
            }
            Plan::Exhausted => panic!("expected a slice"),
        }
    }

    #[test]
    fn test_full_then_partial_then_exhausted() {
        let all = items(5);
        let planner = BatchPlanner::new(3, None);

        let first = plan_of(planner.next_slice(&all, Cursor::default()));
        assert_eq!((first.start, first.end, first.batch_index), (0, 3, 0));

        let second = plan_of(planner.next_slice(&all, first.completed_cursor()));
        assert_eq!((second.start, second.end, second.batch_index), (3, 5, 1));
        assert_eq!(second.len(), 2);

        assert_eq!(
            planner.next_slice(&all, second.completed_cursor()),
            Plan::Exhausted
        );
    }

    #[test]
    fn test_cap_bounds_slice() {
        let all = items(10);
        let planner = BatchPlanner::new(4, Some(6));

        let first = plan_of(planner.next_slice(&all, Cursor::default()));
        assert_eq!(first.end, 4);
        let second = plan_of(planner.next_slice(&all, first.completed_cursor()));
        assert_eq!(second.end, 6);
        assert_eq!(
            planner.next_slice(&all, second.completed_cursor()),
            Plan::Exhausted
        );
    }

    #[test]
    fn test_empty_input_is_exhausted() {
        let planner = BatchPlanner::new(3, None);
        assert_eq!(planner.next_slice(&[], Cursor::default()), Plan::Exhausted);
    }

    #[test]
    fn test_cursor_past_end_is_exhausted() {
        let all = items(2);
        let planner = BatchPlanner::new(3, None);
        assert_eq!(planner.next_slice(&all, Cursor::new(7, 3)), Plan::Exhausted);
    }

    #[test]
    fn test_artifact_name_includes_bounds() {
        let plan = BatchPlan {
            batch_index: 1,
            start: 4000,
            end: 8000,
        };
        assert_eq!(plan.artifact_name(), "batch_4000-8000.json");
    }
}
