use std::collections::HashMap;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::{CTree, Config, Handle, SparseOffset};

/// Model: plain vectors, spliced with plain copies. Every operation runs
/// against both the store and the model, and every content the store has
/// named so far must keep resolving to the same handle.
struct Test {
    tree: CTree,
    /// Content behind each produced handle, in production order.
    model: Vec<Vec<u32>>,
    handles: Vec<Handle>,
    /// Canonical handle per content, for determinism checks.
    seen: HashMap<Vec<u32>, Handle>,
    /// Indices of contents produced by plain inserts (findable).
    inserted: Vec<usize>,
}

/// Index into the handles produced so far, wrapped at use.
#[derive(Debug, Clone, Copy)]
struct Pick(u8);

/// Generated vector content with a length mix that exercises the empty,
/// single-word, pair, power-of-two and unbalanced shapes.
#[derive(Debug, Clone)]
struct Content(Vec<u32>);

#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Insert(Content),
    Delta {
        target: Pick,
        offset: u8,
        delta: Content,
    },
    Extend {
        target: Pick,
        alignment_log2: u8,
        delta: Content,
    },
    ExtendAt {
        target: Pick,
        padding: u8,
        delta: Content,
    },
    MayExtend {
        target: Pick,
        offset: u8,
        delta: Content,
    },
    Sparse {
        target: Pick,
        cuts: [u8; 3],
    },
    ReadBack(Pick),
    Partial {
        target: Pick,
        offset: u8,
        span: u8,
    },
    Find(Pick),
}

impl Arbitrary for Pick {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        any::<u8>().prop_map(Pick).boxed()
    }
}

impl Arbitrary for Content {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            Just(Content(vec![])),
            prop::collection::vec(any::<u32>(), 1..3).prop_map(Content),
            // Small word values collide across vectors and share leaves.
            prop::collection::vec(0u32..8, 3..20).prop_map(Content),
            prop::collection::vec(any::<u32>(), 16..17).prop_map(Content),
            prop::collection::vec(any::<u32>(), 3..40).prop_map(Content),
            // Zero runs exercise the reserved-key path.
            prop::collection::vec(0u32..2, 3..24).prop_map(Content),
        ]
        .boxed()
    }
}

impl Test {
    fn new() -> Self {
        Self {
            tree: CTree::with_config(Config {
                root_scale: 18,
                data_scale: 18,
            }),
            model: Vec::new(),
            handles: Vec::new(),
            seen: HashMap::new(),
            inserted: Vec::new(),
        }
    }

    fn pick(&self, p: Pick) -> Option<usize> {
        if self.handles.is_empty() {
            None
        } else {
            Some(p.0 as usize % self.handles.len())
        }
    }

    fn record(&mut self, content: Vec<u32>, handle: Handle) {
        assert_eq!(handle.length(), content.len() as u64);
        match self.seen.get(&content) {
            Some(&h) => assert_eq!(h, handle, "same content, different handle"),
            None => {
                self.seen.insert(content.clone(), handle);
            }
        }
        self.model.push(content);
        self.handles.push(handle);
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Insert(Content(data)) => {
                let r = self.tree.insert(&data, true).unwrap();
                // Freshness is single-use: set for exactly the first
                // naming of a multi-word content.
                if data.len() >= 2 {
                    assert_eq!(r.fresh(), !self.seen.contains_key(&data));
                }
                self.inserted.push(self.model.len());
                self.record(data, r.handle());
            }
            Action::Delta {
                target,
                offset,
                delta: Content(mut delta),
            } => {
                let Some(t) = self.pick(target) else { return };
                let len = self.model[t].len();
                if len == 0 {
                    return;
                }
                let offset = offset as usize % len;
                delta.truncate(len - offset);
                let r = self.tree.delta(self.handles[t], offset as u64, &delta, true).unwrap();
                let mut expected = self.model[t].clone();
                expected[offset..offset + delta.len()].copy_from_slice(&delta);
                if expected == self.model[t] {
                    assert_eq!(r.handle(), self.handles[t]);
                }
                self.record(expected, r.handle());
            }
            Action::Extend {
                target,
                alignment_log2,
                delta: Content(delta),
            } => {
                let Some(t) = self.pick(target) else { return };
                if !self.handles[t].exists() && delta.is_empty() {
                    return;
                }
                let alignment = 1u64 << (alignment_log2 % 7);
                let r = self.tree.extend(self.handles[t], alignment, &delta, true).unwrap();
                let mut expected = self.model[t].clone();
                let padded = expected.len().next_multiple_of(alignment as usize);
                expected.resize(padded, 0);
                expected.extend_from_slice(&delta);
                self.record(expected, r.handle());
            }
            Action::ExtendAt {
                target,
                padding,
                delta: Content(delta),
            } => {
                let Some(t) = self.pick(target) else { return };
                if !self.handles[t].exists() && delta.is_empty() {
                    return;
                }
                let padding = u64::from(padding % 9);
                let r = self.tree.extend_at(self.handles[t], padding, &delta, true).unwrap();
                let mut expected = self.model[t].clone();
                expected.resize(expected.len() + padding as usize, 0);
                expected.extend_from_slice(&delta);
                self.record(expected, r.handle());
            }
            Action::MayExtend {
                target,
                offset,
                delta: Content(delta),
            } => {
                let Some(t) = self.pick(target) else { return };
                let len = self.model[t].len();
                let offset = offset as usize % (len + 6);
                let r = self
                    .tree
                    .delta_may_extend(self.handles[t], offset as u64, &delta, true)
                    .unwrap();
                let mut expected = self.model[t].clone();
                if !delta.is_empty() {
                    expected.resize(len.max(offset + delta.len()), 0);
                    expected[offset..offset + delta.len()].copy_from_slice(&delta);
                }
                self.record(expected, r.handle());
            }
            Action::Sparse { target, cuts } => {
                let Some(t) = self.pick(target) else { return };
                let len = self.model[t].len();
                if len == 0 {
                    return;
                }
                // Up to three windows carved deterministically from the
                // cut bytes.
                let mut windows = Vec::new();
                let mut pos = 0usize;
                for c in cuts {
                    let start = pos + c as usize % 5;
                    if start >= len {
                        break;
                    }
                    let span = 1 + (c / 16) as usize % (len - start).min(9);
                    windows.push(SparseOffset::new(start as u32, span as u32));
                    pos = start + span;
                }
                if windows.is_empty() {
                    return;
                }
                let total: usize = windows.iter().map(|w| w.len() as usize).sum();
                let delta: Vec<u32> = (0..total as u32).map(|i| 0x5150_0000 + i).collect();
                let mut expected = self.model[t].clone();
                let mut used = 0;
                for w in &windows {
                    let (o, l) = (w.offset() as usize, w.len() as usize);
                    expected[o..o + l].copy_from_slice(&delta[used..used + l]);
                    used += l;
                }
                let r = self
                    .tree
                    .delta_sparse(self.handles[t], &delta, &mut windows, true)
                    .unwrap();
                self.record(expected, r.handle());
            }
            Action::ReadBack(target) => {
                let Some(t) = self.pick(target) else { return };
                let mut out = vec![0u32; self.model[t].len()];
                self.tree.get(self.handles[t], &mut out, true);
                assert_eq!(out, self.model[t]);
            }
            Action::Partial { target, offset, span } => {
                let Some(t) = self.pick(target) else { return };
                let len = self.model[t].len();
                let offset = offset as usize % (len + 1);
                let span = span as usize % (len - offset + 1);
                let mut out = vec![0u32; span];
                self.tree
                    .get_partial(self.handles[t], offset as u64, span as u64, &mut out, true);
                assert_eq!(out, &self.model[t][offset..offset + span]);
            }
            Action::Find(target) => {
                if self.inserted.is_empty() {
                    return;
                }
                let t = self.inserted[target.0 as usize % self.inserted.len()];
                assert_eq!(
                    self.tree.find(&self.model[t], true),
                    Some(self.handles[t])
                );
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn proptest_vs_splice_model(actions in prop::collection::vec(any::<Action>(), 1..48)) {
        let mut test = Test::new();
        for action in actions {
            test.execute(action);
        }
        // Everything produced over the run still reads back.
        for (content, handle) in test.model.iter().zip(&test.handles) {
            let mut out = vec![0u32; content.len()];
            test.tree.get(*handle, &mut out, true);
            prop_assert_eq!(&out, content);
        }
    }

    #[test]
    fn proptest_roundtrip(data in prop::collection::vec(any::<u32>(), 0..300)) {
        let tree = CTree::with_config(Config { root_scale: 16, data_scale: 16 });
        let r = tree.insert(&data, true).unwrap();
        let mut out = vec![0u32; data.len()];
        tree.get(r.handle(), &mut out, true);
        prop_assert_eq!(out, data);
    }
}
