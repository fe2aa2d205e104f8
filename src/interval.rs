//! Closed-interval index used to ask "is this timestamp inside a silence".
//!
//! AVL tree keyed on `(start, end)`, each node carrying the largest `end` in
//! its subtree so point queries can prune whole branches.

use std::cmp::Ordering;

#[derive(Debug)]
struct Node<T> {
    start: u64,
    end: u64,
    max_end: u64,
    height: i32,
    payload: T,
    left: Option<Box<Node<T>>>,
    right: Option<Box<Node<T>>>,
}

#[derive(Debug)]
pub struct IntervalTree<T> {
    root: Option<Box<Node<T>>>,
    len: usize,
}

impl<T> Default for IntervalTree<T> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl<T> IntervalTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `[start, end]`. Reversed bounds are swapped.
    pub fn insert(&mut self, start: u64, end: u64, payload: T) {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let node = Box::new(Node {
            start,
            end,
            max_end: end,
            height: 1,
            payload,
            left: None,
            right: None,
        });
        self.root = Some(insert_node(self.root.take(), node));
        self.len += 1;
    }

    /// Payloads of every stored interval containing `point`, bounds inclusive,
    /// in ascending order of interval start.
    pub fn overlaps(&self, point: u64) -> Vec<&T> {
        let mut found = Vec::new();
        collect_overlaps(self.root.as_deref(), point, &mut found);
        found
    }
}

fn height<T>(node: &Option<Box<Node<T>>>) -> i32 {
    node.as_ref().map_or(0, |n| n.height)
}

fn max_end<T>(node: &Option<Box<Node<T>>>) -> u64 {
    node.as_ref().map_or(0, |n| n.max_end)
}

fn update<T>(node: &mut Node<T>) {
    node.height = 1 + height(&node.left).max(height(&node.right));
    node.max_end = node
        .end
        .max(max_end(&node.left))
        .max(max_end(&node.right));
}

fn balance_factor<T>(node: &Node<T>) -> i32 {
    height(&node.left) - height(&node.right)
}

fn rotate_right<T>(mut node: Box<Node<T>>) -> Box<Node<T>> {
    match node.left.take() {
        Some(mut pivot) => {
            node.left = pivot.right.take();
            update(&mut node);
            pivot.right = Some(node);
            update(&mut pivot);
            pivot
        }
        None => node,
    }
}

fn rotate_left<T>(mut node: Box<Node<T>>) -> Box<Node<T>> {
    match node.right.take() {
        Some(mut pivot) => {
            node.right = pivot.left.take();
            update(&mut node);
            pivot.left = Some(node);
            update(&mut pivot);
            pivot
        }
        None => node,
    }
}

fn rebalance<T>(mut node: Box<Node<T>>) -> Box<Node<T>> {
    update(&mut node);
    let factor = balance_factor(&node);
    if factor > 1 {
        if node.left.as_deref().is_some_and(|l| balance_factor(l) < 0) {
            node.left = node.left.take().map(rotate_left);
        }
        return rotate_right(node);
    }
    if factor < -1 {
        if node.right.as_deref().is_some_and(|r| balance_factor(r) > 0) {
            node.right = node.right.take().map(rotate_right);
        }
        return rotate_left(node);
    }
    node
}

fn insert_node<T>(node: Option<Box<Node<T>>>, new: Box<Node<T>>) -> Box<Node<T>> {
    let Some(mut node) = node else {
        return new;
    };
    match (new.start, new.end).cmp(&(node.start, node.end)) {
        Ordering::Less => node.left = Some(insert_node(node.left.take(), new)),
        _ => node.right = Some(insert_node(node.right.take(), new)),
    }
    rebalance(node)
}

fn collect_overlaps<'a, T>(node: Option<&'a Node<T>>, point: u64, found: &mut Vec<&'a T>) {
    let Some(node) = node else {
        return;
    };
    if node.max_end < point {
        return;
    }
    collect_overlaps(node.left.as_deref(), point, found);
    if node.start > point {
        // everything to the right starts even later
        return;
    }
    if point <= node.end {
        found.push(&node.payload);
    }
    collect_overlaps(node.right.as_deref(), point, found);
}
