//! Radix trie over URI path patterns.
//!
//! Patterns are inserted segment-wise: literal segments, `:name`
//! parameter segments, and a trailing `*` marking a prefix pattern
//! (`/api/*` or `/api*`). Each terminal holds a candidate list ordered
//! by descending priority, stable on insertion order within a priority
//! class. Collection returns candidates most-specific-first.

use std::collections::HashMap;

/// Specificity class of a matched terminal. Higher wins.
const KIND_CATCH_ALL: u8 = 1;
const KIND_PARTIAL: u8 = 2;
const KIND_EXACT_PARAM: u8 = 3;
const KIND_EXACT_STATIC: u8 = 4;

struct Slot<T> {
    priority: i32,
    seq: usize,
    value: T,
}

struct Node<T> {
    children: HashMap<String, Node<T>>,
    param: Option<Box<Node<T>>>,
    /// Exact patterns terminating at this node.
    terminals: Vec<Slot<T>>,
    /// `/seg/*` patterns anchored here; match this node and everything below.
    catch_all: Vec<Slot<T>>,
    /// `seg*` patterns: partial last segment, pure prefix on the rest.
    partial: Vec<(String, Vec<Slot<T>>)>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            param: None,
            terminals: Vec::new(),
            catch_all: Vec::new(),
            partial: Vec::new(),
        }
    }
}

/// Radix trie mapping URI patterns to candidate payloads.
pub struct Trie<T> {
    root: Node<T>,
    seq: usize,
}

impl<T> Trie<T> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            seq: 0,
        }
    }

    /// Inserts a pattern. Insertion order breaks priority ties.
    pub fn insert(&mut self, pattern: &str, priority: i32, value: T) {
        let slot = Slot {
            priority,
            seq: self.seq,
            value,
        };
        self.seq += 1;

        if let Some(prefix) = pattern.strip_suffix('*') {
            if prefix.is_empty() || prefix.ends_with('/') {
                // "/api/*": anchored after complete segments.
                let node = descend(&mut self.root, &segments(prefix));
                node.catch_all.push(slot);
            } else {
                // "/api*": the last segment is itself a prefix.
                let segs = segments(prefix);
                let (last, init) = segs
                    .split_last()
                    .expect("non-empty prefix has at least one segment");
                let node = descend(&mut self.root, init);
                match node.partial.iter_mut().find(|(p, _)| p == last) {
                    Some((_, slots)) => slots.push(slot),
                    None => node.partial.push((last.to_string(), vec![slot])),
                }
            }
            return;
        }

        let node = descend(&mut self.root, &segments(pattern));
        node.terminals.push(slot);
    }

    /// Orders every candidate list; call once after the last insert.
    pub fn finalize(&mut self) {
        finalize_node(&mut self.root);
    }

    /// Collects candidates matching `path`, most specific first:
    /// deeper anchors beat shallower ones, exact beats prefix, static
    /// segments beat parameters, then priority and insertion order.
    pub fn collect(&self, path: &str) -> Vec<&T> {
        let segs = segments(path);
        let mut hits: Vec<(usize, u8, &Slot<T>)> = Vec::new();
        walk(&self.root, &segs, 0, false, &mut hits);

        hits.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(b.2.priority.cmp(&a.2.priority))
                .then(a.2.seq.cmp(&b.2.seq))
        });
        hits.into_iter().map(|(_, _, slot)| &slot.value).collect()
    }
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn descend<'a, T>(root: &'a mut Node<T>, segs: &[&str]) -> &'a mut Node<T> {
    let mut cur = root;
    for seg in segs {
        cur = if seg.starts_with(':') {
            &mut **cur.param.get_or_insert_with(Default::default)
        } else {
            cur.children.entry(seg.to_string()).or_default()
        };
    }
    cur
}

fn finalize_node<T>(node: &mut Node<T>) {
    let order = |slots: &mut Vec<Slot<T>>| {
        slots.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    };
    order(&mut node.terminals);
    order(&mut node.catch_all);
    for (_, slots) in &mut node.partial {
        order(slots);
    }
    for child in node.children.values_mut() {
        finalize_node(child);
    }
    if let Some(param) = &mut node.param {
        finalize_node(param);
    }
}

fn walk<'a, T>(
    node: &'a Node<T>,
    segs: &[&str],
    idx: usize,
    via_param: bool,
    out: &mut Vec<(usize, u8, &'a Slot<T>)>,
) {
    for slot in &node.catch_all {
        out.push((idx, KIND_CATCH_ALL, slot));
    }

    if idx == segs.len() {
        let kind = if via_param {
            KIND_EXACT_PARAM
        } else {
            KIND_EXACT_STATIC
        };
        for slot in &node.terminals {
            out.push((idx, kind, slot));
        }
        return;
    }

    let seg = segs[idx];
    for (prefix, slots) in &node.partial {
        if seg.starts_with(prefix.as_str()) {
            for slot in slots {
                out.push((idx, KIND_PARTIAL, slot));
            }
        }
    }
    if let Some(child) = node.children.get(seg) {
        walk(child, segs, idx + 1, via_param, out);
    }
    if let Some(param) = &node.param {
        walk(param, segs, idx + 1, true, out);
    }
}
