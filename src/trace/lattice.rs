//! Word lattice recovered from predecessor and sibling links.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;

use super::{Trace, TraceKind};
use crate::error::Result;
use crate::network::Lexicon;
use crate::types::{LemmaId, Score, ScoreVector, TimeframeIndex};

#[derive(Debug, Clone, Serialize)]
pub struct LatticeNode {
    pub time: TimeframeIndex,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatticeArc {
    pub from: usize,
    pub to: usize,
    pub kind: TraceKind,
    /// Score gained on the arc.
    pub score: ScoreVector,
}

/// Lattice whose nodes are sibling groups: a trace and all traces that
/// lost a recombination against it end in the same node.
#[derive(Debug, Clone, Serialize)]
pub struct WordLattice {
    pub nodes: Vec<LatticeNode>,
    pub arcs: Vec<LatticeArc>,
    pub initial: usize,
    pub final_node: usize,
}

impl WordLattice {
    pub fn from_trace(end: &Arc<Trace>) -> Self {
        let mut ids: FxHashMap<*const Trace, usize> = FxHashMap::default();
        let mut nodes = Vec::new();
        let mut arcs = Vec::new();
        let mut initial = None;

        ids.insert(Arc::as_ptr(end), 0);
        nodes.push(LatticeNode { time: end.time });
        let mut stack = vec![Arc::clone(end)];

        while let Some(head) = stack.pop() {
            let to = ids[&Arc::as_ptr(&head)];
            for member in head.siblings() {
                let Some(predecessor) = member.predecessor.as_ref() else {
                    initial.get_or_insert(to);
                    continue;
                };
                let key = Arc::as_ptr(predecessor);
                let from = match ids.get(&key) {
                    Some(id) => *id,
                    None => {
                        let id = nodes.len();
                        ids.insert(key, id);
                        nodes.push(LatticeNode {
                            time: predecessor.time,
                        });
                        stack.push(Arc::clone(predecessor));
                        id
                    }
                };
                arcs.push(LatticeArc {
                    from,
                    to,
                    kind: member.kind,
                    score: member.score - predecessor.score,
                });
            }
        }

        Self {
            nodes,
            arcs,
            initial: initial.unwrap_or(0),
            final_node: 0,
        }
    }

    /// Best total score from the initial to the final node.
    pub fn best_path_score(&self) -> Score {
        let n = self.nodes.len();
        let mut incoming = vec![0usize; n];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (index, arc) in self.arcs.iter().enumerate() {
            incoming[arc.to] += 1;
            outgoing[arc.from].push(index);
        }

        let mut best = vec![Score::INFINITY; n];
        best[self.initial] = 0.0;
        let mut queue: Vec<usize> = (0..n).filter(|node| incoming[*node] == 0).collect();
        while let Some(node) = queue.pop() {
            for &index in &outgoing[node] {
                let arc = &self.arcs[index];
                let candidate = best[node] + arc.score.total();
                if candidate < best[arc.to] {
                    best[arc.to] = candidate;
                }
                incoming[arc.to] -= 1;
                if incoming[arc.to] == 0 {
                    queue.push(arc.to);
                }
            }
        }
        best[self.final_node]
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Unlink siblings of `trace` whose word is the silence lemma.
pub fn prune_silence_siblings(trace: &Arc<Trace>, lexicon: &Lexicon, silence: LemmaId) {
    let is_silence = |t: &Trace| {
        t.pronunciation()
            .and_then(|p| lexicon.pronunciation(p))
            .is_some_and(|p| p.lemma == silence)
    };

    let mut current = Arc::clone(trace);
    while let Some(sibling) = current.sibling() {
        if is_silence(&sibling) {
            current.set_sibling(sibling.sibling());
        } else {
            current = sibling;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{link_sibling, Transit};
    use crate::types::{PhonemeId, PronunciationId};

    fn word(pred: &Arc<Trace>, pron: u32, time: u32, am: f64, lm: f64) -> Arc<Trace> {
        Arc::new(Trace::new(
            Some(Arc::clone(pred)),
            TraceKind::Word(PronunciationId(pron)),
            time,
            ScoreVector::new(am, lm),
            Transit::default(),
        ))
    }

    #[test]
    fn test_lattice_from_sibling_groups() {
        let start = Arc::new(Trace::boundary(0, Transit::default()));
        let a = word(&start, 0, 5, 4.0, 1.0);
        let b = word(&start, 1, 5, 5.0, 1.0);
        link_sibling(&a, &b);
        let c = word(&a, 2, 9, 8.0, 2.0);
        let end = Arc::new(Trace::new(
            Some(Arc::clone(&c)),
            TraceKind::Boundary,
            9,
            ScoreVector::new(8.0, 2.5),
            Transit::default(),
        ));

        let lattice = WordLattice::from_trace(&end);
        // end, c, {a, b}, start
        assert_eq!(lattice.nodes.len(), 4);
        assert_eq!(lattice.arcs.len(), 4);
        assert_eq!(lattice.best_path_score(), end.score.total());
        assert_eq!(lattice.nodes[lattice.initial].time, 0);

        let json = lattice.to_json().unwrap();
        assert!(json.contains("\"arcs\""));
    }

    #[test]
    fn test_prune_silence_siblings() {
        let mut lexicon = Lexicon::new();
        let word_lemma = lexicon.add_lemma("w", vec![]);
        let silence = lexicon.add_lemma("[SILENCE]", vec![]);
        let w = lexicon.add_pronunciation(word_lemma, vec![PhonemeId(0)], 0.0);
        let sil = lexicon.add_pronunciation(silence, vec![PhonemeId(1)], 0.0);

        let start = Arc::new(Trace::boundary(0, Transit::default()));
        let best = word(&start, sil.value(), 3, 1.0, 0.0);
        let other = word(&start, w.value(), 3, 2.0, 0.0);
        let quiet = word(&start, sil.value(), 3, 3.0, 0.0);
        link_sibling(&best, &other);
        link_sibling(&best, &quiet);

        prune_silence_siblings(&best, &lexicon, silence);
        let chain: Vec<_> = best.siblings().filter_map(|t| t.pronunciation()).collect();
        // the head is kept even when it is silence
        assert_eq!(chain, vec![sil, w]);
    }
}
