//! Rule-based ordering.
//!
//! Items carry declarative rules (`First`, `Last`, `Before(x)`, `After(x)`).
//! The rules become edges of a graph that is sorted topologically; among
//! items whose constraints are satisfied the one with the smallest
//! `(tiebreak, key)` goes next, so the output never depends on input order.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt::Display;

/// Ordering constraint of one item relative to the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "other", rename_all = "lowercase")]
pub enum SortRule<K> {
    /// Before every item that is not itself `First`.
    First,
    /// After every item that is not itself `Last`.
    Last,
    /// Before the given item.
    Before(K),
    /// After the given item.
    After(K),
}

/// Graph node: an item index or one of the two barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Node {
    FirstBarrier,
    LastBarrier,
    Item(usize),
}

/// Sort `items` so that every rule holds.
///
/// `key` identifies an item and is what `Before`/`After` refer to.
/// Fails with [`Error::CyclicOrder`] if the rules contradict each other or
/// reference a key that is not among `items`.
pub fn sort_by_rules<T, K, B, FK, FR, FB>(
    items: Vec<T>,
    key: FK,
    rules: FR,
    tiebreak: FB,
) -> Result<Vec<T>>
where
    K: Ord + Clone + Display,
    B: Ord + Clone,
    FK: Fn(&T) -> K,
    FR: Fn(&T) -> Vec<SortRule<K>>,
    FB: Fn(&T) -> B,
{
    let keys: Vec<K> = items.iter().map(&key).collect();
    let index: BTreeMap<&K, usize> = keys.iter().enumerate().map(|(i, k)| (k, i)).collect();

    let mut edges: BTreeMap<Node, Vec<Node>> = BTreeMap::new();
    let mut in_degree: BTreeMap<Node, usize> = BTreeMap::new();
    in_degree.insert(Node::FirstBarrier, 0);
    in_degree.insert(Node::LastBarrier, 0);
    for i in 0..items.len() {
        in_degree.insert(Node::Item(i), 0);
    }
    let mut add_edge = |from: Node, to: Node| {
        edges.entry(from).or_default().push(to);
        *in_degree.entry(to).or_default() += 1;
    };

    // FirstBarrier -> LastBarrier keeps the two groups apart when nothing is in between
    add_edge(Node::FirstBarrier, Node::LastBarrier);

    for (i, item) in items.iter().enumerate() {
        let item_rules = rules(item);
        let is_first = item_rules.iter().any(|r| matches!(r, SortRule::First));
        let is_last = item_rules.iter().any(|r| matches!(r, SortRule::Last));

        if is_first {
            add_edge(Node::Item(i), Node::FirstBarrier);
        } else {
            add_edge(Node::FirstBarrier, Node::Item(i));
        }
        if is_last {
            add_edge(Node::LastBarrier, Node::Item(i));
        } else {
            add_edge(Node::Item(i), Node::LastBarrier);
        }

        for rule in &item_rules {
            let (other, before) = match rule {
                SortRule::Before(other) => (other, true),
                SortRule::After(other) => (other, false),
                SortRule::First | SortRule::Last => continue,
            };
            let Some(&j) = index.get(other) else {
                return Err(Error::cyclic_order(vec![
                    keys[i].to_string(),
                    format!("{} (missing)", other),
                ]));
            };
            if before {
                add_edge(Node::Item(i), Node::Item(j));
            } else {
                add_edge(Node::Item(j), Node::Item(i));
            }
        }
    }

    // Kahn's algorithm; barriers sort ahead of items but never compete with them
    let rank = |node: Node| match node {
        Node::Item(i) => Some((tiebreak(&items[i]), keys[i].clone())),
        _ => None,
    };
    let mut ready: BinaryHeap<Reverse<(Option<(B, K)>, Node)>> = in_degree
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(&node, _)| Reverse((rank(node), node)))
        .collect();

    let mut order = Vec::with_capacity(items.len());
    while let Some(Reverse((_, node))) = ready.pop() {
        if let Node::Item(i) = node {
            order.push(i);
        }
        for &next in edges.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((rank(next), next)));
                }
            }
        }
    }

    if order.len() != items.len() {
        let mut stuck: Vec<String> = in_degree
            .iter()
            .filter_map(|(node, &degree)| match node {
                Node::Item(i) if degree > 0 => Some(keys[*i].to_string()),
                _ => None,
            })
            .collect();
        stuck.sort();
        return Err(Error::cyclic_order(stuck));
    }

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}
