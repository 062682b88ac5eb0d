//! A persistent, height-balanced (AVL) binary search tree over byte-string
//! keys, used as the key directory's backing structure (§4.3).
//!
//! Every mutation returns a new root; the path from the old root to the
//! changed key is copied, everything else is shared via `Arc`. A reader
//! holding an old root observes the tree exactly as it was at the moment it
//! was cloned, regardless of later writes — this is the "snapshot read"
//! property spec.md leans on for lock-free `Get`/`Scan`/iteration.
//!
//! spec.md calls this a "radix tree" but explicitly permits any ordered,
//! cheaply-cloneable, copy-on-write structure (crit-bit, ART, B+-tree with
//! RCU, ...); a balanced persistent BST satisfies the same contract with
//! far less code.

use std::cmp::Ordering;
use std::sync::Arc;

pub(super) type Link = Option<Arc<Node>>;

struct Node {
    key: Vec<u8>,
    value: super::Item,
    height: u8,
    left: Link,
    right: Link,
}

fn height(link: &Link) -> u8 {
    link.as_ref().map_or(0, |n| n.height)
}

fn balance_factor(link: &Link) -> i16 {
    match link {
        None => 0,
        Some(n) => height(&n.left) as i16 - height(&n.right) as i16,
    }
}

fn make(key: Vec<u8>, value: super::Item, left: Link, right: Link) -> Arc<Node> {
    let h = 1 + height(&left).max(height(&right));
    Arc::new(Node { key, value, height: h, left, right })
}

fn rotate_left(n: &Node) -> Arc<Node> {
    let r = n.right.as_ref().expect("rotate_left requires a right child");
    let new_left = make(n.key.clone(), n.value.clone(), n.left.clone(), r.left.clone());
    make(r.key.clone(), r.value.clone(), Some(new_left), r.right.clone())
}

fn rotate_right(n: &Node) -> Arc<Node> {
    let l = n.left.as_ref().expect("rotate_right requires a left child");
    let new_right = make(n.key.clone(), n.value.clone(), l.right.clone(), n.right.clone());
    make(l.key.clone(), l.value.clone(), l.left.clone(), Some(new_right))
}

fn rebalance(n: &Node) -> Arc<Node> {
    let bf = height(&n.left) as i16 - height(&n.right) as i16;
    if bf > 1 {
        let left = n.left.as_ref().unwrap();
        if balance_factor(&n.left) < 0 {
            let new_left = rotate_left(left);
            return rotate_right(&Node {
                key: n.key.clone(),
                value: n.value.clone(),
                height: n.height,
                left: Some(new_left),
                right: n.right.clone(),
            });
        }
        return rotate_right(n);
    }
    if bf < -1 {
        let right = n.right.as_ref().unwrap();
        if balance_factor(&n.right) > 0 {
            let new_right = rotate_right(right);
            return rotate_left(&Node {
                key: n.key.clone(),
                value: n.value.clone(),
                height: n.height,
                left: n.left.clone(),
                right: Some(new_right),
            });
        }
        return rotate_left(n);
    }
    make(n.key.clone(), n.value.clone(), n.left.clone(), n.right.clone())
}

/// Returns `(new_root, true)` if `key` was newly inserted, or
/// `(new_root, false)` if it replaced an existing entry.
pub(super) fn insert(link: &Link, key: &[u8], value: super::Item) -> (Arc<Node>, bool) {
    match link {
        None => (make(key.to_vec(), value, None, None), true),
        Some(n) => match key.cmp(n.key.as_slice()) {
            Ordering::Less => {
                let (new_left, is_new) = insert(&n.left, key, value);
                (rebalance(&Node {
                    key: n.key.clone(),
                    value: n.value.clone(),
                    height: n.height,
                    left: Some(new_left),
                    right: n.right.clone(),
                }), is_new)
            }
            Ordering::Greater => {
                let (new_right, is_new) = insert(&n.right, key, value);
                (rebalance(&Node {
                    key: n.key.clone(),
                    value: n.value.clone(),
                    height: n.height,
                    left: n.left.clone(),
                    right: Some(new_right),
                }), is_new)
            }
            Ordering::Equal => (make(n.key.clone(), value, n.left.clone(), n.right.clone()), false),
        },
    }
}

fn min_node(link: &Link) -> &Arc<Node> {
    let mut cur = link.as_ref().expect("min_node on empty subtree");
    while let Some(left) = &cur.left {
        cur = left;
    }
    cur
}

/// Returns `(new_root, removed)`.
pub(super) fn delete(link: &Link, key: &[u8]) -> (Link, bool) {
    match link {
        None => (None, false),
        Some(n) => match key.cmp(n.key.as_slice()) {
            Ordering::Less => {
                let (new_left, removed) = delete(&n.left, key);
                if !removed {
                    return (Some(n.clone()), false);
                }
                (Some(rebalance(&Node {
                    key: n.key.clone(),
                    value: n.value.clone(),
                    height: n.height,
                    left: new_left,
                    right: n.right.clone(),
                })), true)
            }
            Ordering::Greater => {
                let (new_right, removed) = delete(&n.right, key);
                if !removed {
                    return (Some(n.clone()), false);
                }
                (Some(rebalance(&Node {
                    key: n.key.clone(),
                    value: n.value.clone(),
                    height: n.height,
                    left: n.left.clone(),
                    right: new_right,
                })), true)
            }
            Ordering::Equal => {
                let merged = match (&n.left, &n.right) {
                    (None, None) => None,
                    (Some(l), None) => Some(l.clone()),
                    (None, Some(r)) => Some(r.clone()),
                    (Some(_), Some(_)) => {
                        let successor = min_node(&n.right);
                        let (new_right, _) = delete(&n.right, &successor.key);
                        Some(rebalance(&Node {
                            key: successor.key.clone(),
                            value: successor.value.clone(),
                            height: n.height,
                            left: n.left.clone(),
                            right: new_right,
                        }))
                    }
                };
                (merged, true)
            }
        },
    }
}

pub(super) fn get<'a>(link: &'a Link, key: &[u8]) -> Option<&'a super::Item> {
    let mut cur = link.as_ref();
    while let Some(n) = cur {
        match key.cmp(n.key.as_slice()) {
            Ordering::Less => cur = n.left.as_ref(),
            Ordering::Greater => cur = n.right.as_ref(),
            Ordering::Equal => return Some(&n.value),
        }
    }
    None
}

/// In-order traversal with a `bool`-returning visitor meaning "stop now".
/// Returns whether the visitor requested a stop.
pub(super) fn walk(link: &Link, visitor: &mut dyn FnMut(&[u8], &super::Item) -> bool) -> bool {
    let Some(n) = link else { return false };
    if walk(&n.left, visitor) {
        return true;
    }
    if visitor(&n.key, &n.value) {
        return true;
    }
    walk(&n.right, visitor)
}

/// In-order traversal pruned to keys sharing `prefix`.
pub(super) fn walk_prefix(
    link: &Link,
    prefix: &[u8],
    visitor: &mut dyn FnMut(&[u8], &super::Item) -> bool,
) -> bool {
    let Some(n) = link else { return false };
    if n.key.as_slice() < prefix {
        return walk_prefix(&n.right, prefix, visitor);
    }
    if n.key.starts_with(prefix) {
        if walk_prefix(&n.left, prefix, visitor) {
            return true;
        }
        if visitor(&n.key, &n.value) {
            return true;
        }
        return walk_prefix(&n.right, prefix, visitor);
    }
    // n.key > prefix without sharing it: past the prefix's range, only
    // smaller keys (left) can still match.
    walk_prefix(&n.left, prefix, visitor)
}

/// In-order traversal pruned to `start <= key <= end`.
pub(super) fn walk_range(
    link: &Link,
    start: &[u8],
    end: &[u8],
    visitor: &mut dyn FnMut(&[u8], &super::Item) -> bool,
) -> bool {
    let Some(n) = link else { return false };
    let key = n.key.as_slice();
    if key < start {
        return walk_range(&n.right, start, end, visitor);
    }
    if key > end {
        return walk_range(&n.left, start, end, visitor);
    }
    if walk_range(&n.left, start, end, visitor) {
        return true;
    }
    if visitor(key, &n.value) {
        return true;
    }
    walk_range(&n.right, start, end, visitor)
}

pub(super) fn count(link: &Link) -> usize {
    match link {
        None => 0,
        Some(n) => 1 + count(&n.left) + count(&n.right),
    }
}

/// Stack-based cursor over a tree snapshot, ascending or descending.
pub(super) struct Cursor {
    stack: Vec<Arc<Node>>,
    reverse: bool,
}

impl Cursor {
    pub(super) fn new(root: &Link, reverse: bool) -> Self {
        let mut stack = Vec::new();
        let mut cur = root.clone();
        while let Some(n) = cur {
            let next = if reverse { n.right.clone() } else { n.left.clone() };
            stack.push(n.clone());
            cur = next;
        }
        Self { stack, reverse }
    }

    /// Positions the cursor so the next call to `next()` yields the first
    /// key with `prefix` in ascending order, or one step past the prefix
    /// range in descending order (§4.8).
    pub(super) fn seek_prefix(root: &Link, prefix: &[u8], reverse: bool) -> Self {
        let mut stack = Vec::new();
        let mut cur = root.clone();
        if !reverse {
            while let Some(n) = cur {
                if n.key.as_slice() >= prefix {
                    let left = n.left.clone();
                    stack.push(n);
                    cur = left;
                } else {
                    cur = n.right.clone();
                }
            }
        } else {
            let upper = prefix_upper_bound(prefix);
            while let Some(n) = cur {
                let below_upper = match &upper {
                    Some(bound) => n.key.as_slice() < bound.as_slice(),
                    None => true,
                };
                if below_upper {
                    let right = n.right.clone();
                    stack.push(n);
                    cur = right;
                } else {
                    cur = n.left.clone();
                }
            }
        }
        Self { stack, reverse }
    }

    pub(super) fn next(&mut self) -> Option<(Vec<u8>, super::Item)> {
        let node = self.stack.pop()?;
        let mut cur = if self.reverse { node.left.clone() } else { node.right.clone() };
        while let Some(n) = cur {
            let next = if self.reverse { n.right.clone() } else { n.left.clone() };
            self.stack.push(n.clone());
            cur = next;
        }
        Some((node.key.clone(), node.value.clone()))
    }
}

/// The smallest key strictly greater than every key sharing `prefix`, or
/// `None` if `prefix` is all `0xFF` bytes (no finite upper bound exists).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(&last) = bound.last() {
        if last == 0xFF {
            bound.pop();
        } else {
            *bound.last_mut().unwrap() += 1;
            return Some(bound);
        }
    }
    None
}
