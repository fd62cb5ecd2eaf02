//! Indirection table between hypotheses and traces.
//!
//! Hypotheses carry a [`TraceId`] instead of a trace pointer. An id either
//! names an item as it was created or a lazily corrected view of it. The
//! correction is materialized only when the hypothesis produces a word end.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::Trace;
use crate::types::{History, Score, StateId, TraceId};

/// A trace together with the LM histories of the path that produced it.
#[derive(Debug, Clone)]
pub struct TraceItem {
    pub trace: Arc<Trace>,
    pub history: History,
    pub lookahead_history: History,
}

impl TraceItem {
    pub fn new(trace: Arc<Trace>, history: History, lookahead_history: History) -> Self {
        Self {
            trace,
            history,
            lookahead_history,
        }
    }
}

/// Correction state of a trace id. `Unmodified` only ever turns into
/// `Modified`, never back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Modification {
    Unmodified,
    Modified {
        /// Unmodified id the correction was derived from.
        origin: TraceId,
        /// Frames added to the trace time.
        time_delta: u32,
        /// Acoustic score added to the trace, if corrected.
        score_delta: Option<Score>,
        /// State the corrected boundary was crossed in.
        transit_state: StateId,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    item: TraceItem,
    modification: Modification,
}

#[derive(Debug, Default)]
pub struct TraceManager {
    entries: Vec<Entry>,
}

impl TraceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: TraceItem) -> TraceId {
        self.entries.push(Entry {
            item,
            modification: Modification::Unmodified,
        });
        TraceId((self.entries.len() - 1) as u32)
    }

    pub fn item(&self, id: TraceId) -> &TraceItem {
        &self.entries[id.index()].item
    }

    pub fn trace(&self, id: TraceId) -> &Arc<Trace> {
        &self.entries[id.index()].item.trace
    }

    pub fn is_modified(&self, id: TraceId) -> bool {
        matches!(
            self.entries[id.index()].modification,
            Modification::Modified { .. }
        )
    }

    pub fn modification(&self, id: TraceId) -> &Modification {
        &self.entries[id.index()].modification
    }

    /// The id the correction of `id` was derived from, or `id` itself.
    pub fn unmodified(&self, id: TraceId) -> TraceId {
        match self.entries[id.index()].modification {
            Modification::Unmodified => id,
            Modification::Modified { origin, .. } => origin,
        }
    }

    /// Attach a correction to the item behind `id`. Deltas are absolute with
    /// respect to the item, so modifying a modified id replaces its
    /// correction. The result is always a modified id.
    pub fn modify(
        &mut self,
        id: TraceId,
        time_delta: u32,
        score_delta: Option<Score>,
        transit_state: StateId,
    ) -> TraceId {
        let origin = self.unmodified(id);
        let item = self.entries[id.index()].item.clone();
        self.entries.push(Entry {
            item,
            modification: Modification::Modified {
                origin,
                time_delta,
                score_delta,
                transit_state,
            },
        });
        TraceId((self.entries.len() - 1) as u32)
    }

    /// Drop every entry not reachable from `live` and compact the table.
    /// Returns the mapping from surviving old ids to new ids.
    pub fn cleanup<I>(&mut self, live: I) -> FxHashMap<TraceId, TraceId>
    where
        I: IntoIterator<Item = TraceId>,
    {
        let mut keep = vec![false; self.entries.len()];
        for id in live {
            keep[id.index()] = true;
            if let Modification::Modified { origin, .. } = self.entries[id.index()].modification {
                keep[origin.index()] = true;
            }
        }

        let mut mapping = FxHashMap::default();
        let entries = std::mem::take(&mut self.entries);
        self.entries.reserve(keep.iter().filter(|k| **k).count());
        for (old, entry) in entries.into_iter().enumerate() {
            if keep[old] {
                mapping.insert(TraceId(old as u32), TraceId(self.entries.len() as u32));
                self.entries.push(entry);
            }
        }

        for entry in &mut self.entries {
            if let Modification::Modified { origin, .. } = &mut entry.modification {
                if let Some(new) = mapping.get(origin) {
                    *origin = *new;
                }
            }
        }
        mapping
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Transit;

    fn item(time: u32) -> TraceItem {
        TraceItem::new(
            Arc::new(Trace::boundary(time, Transit::default())),
            History(0),
            History(0),
        )
    }

    #[test]
    fn test_modify_is_one_way() {
        let mut manager = TraceManager::new();
        let id = manager.add(item(3));
        assert!(!manager.is_modified(id));

        let modified = manager.modify(id, 2, Some(-0.5), 7);
        assert!(manager.is_modified(modified));
        assert_eq!(manager.unmodified(modified), id);

        let again = manager.modify(modified, 4, None, 8);
        assert!(manager.is_modified(again));
        assert_eq!(manager.unmodified(again), id);
        assert_eq!(
            *manager.modification(again),
            Modification::Modified {
                origin: id,
                time_delta: 4,
                score_delta: None,
                transit_state: 8
            }
        );
        assert!(Arc::ptr_eq(manager.trace(again), manager.trace(id)));
    }

    #[test]
    fn test_cleanup_keeps_live_and_origins() {
        let mut manager = TraceManager::new();
        let dead = manager.add(item(0));
        let origin = manager.add(item(1));
        let live = manager.add(item(2));
        let modified = manager.modify(origin, 1, None, 3);

        let mapping = manager.cleanup([live, modified]);
        assert_eq!(manager.len(), 3);
        assert!(!mapping.contains_key(&dead));

        let new_modified = mapping[&modified];
        let new_origin = mapping[&origin];
        assert_eq!(manager.unmodified(new_modified), new_origin);
        assert_eq!(manager.trace(mapping[&live]).time, 2);
        assert_eq!(manager.trace(new_origin).time, 1);
    }
}
