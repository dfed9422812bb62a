use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::work_item::WorkItem;

/// A directed `source -> target` pair from a link query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationEdge {
    pub source_id: i64,
    pub target_id: i64,
}

impl RelationEdge {
    pub fn new(source_id: i64, target_id: i64) -> Self {
        Self {
            source_id,
            target_id,
        }
    }
}

/// A work item with the items it owns. There is no back-reference to the
/// parent, so a built forest is always finite and acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemTreeNode {
    pub work_item: WorkItem,
    pub children: Vec<WorkItemTreeNode>,
}

/// Assemble the relation forest for a link query.
///
/// `items` is the node map in iteration order; a repeated id keeps its first
/// record. A node is a root when its id is never the target of an edge, and
/// roots come out in `items` order. A child appears under every parent that
/// links to it, once per edge, so shared items are copied into each branch.
/// Edges naming an unknown id are ignored. An edge back to an ancestor on the
/// current path is not followed, and a cycle with no outside root yields no
/// output at all.
pub fn build_forest(edges: &[RelationEdge], items: Vec<WorkItem>) -> Vec<WorkItemTreeNode> {
    let mut order = Vec::with_capacity(items.len());
    let mut nodes: HashMap<i64, WorkItem> = HashMap::with_capacity(items.len());
    for item in items {
        if !nodes.contains_key(&item.id) {
            order.push(item.id);
            nodes.insert(item.id, item);
        }
    }

    let mut children_of: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut parent_of: HashMap<i64, i64> = HashMap::new();
    for edge in edges {
        children_of
            .entry(edge.source_id)
            .or_default()
            .push(edge.target_id);
        parent_of.insert(edge.target_id, edge.source_id);
    }

    order
        .into_iter()
        .filter(|id| !parent_of.contains_key(id))
        .filter_map(|id| nodes.get(&id).cloned())
        .map(|root| assemble(root, &nodes, &children_of))
        .collect()
}

struct Frame<'a> {
    item: WorkItem,
    pending: std::slice::Iter<'a, i64>,
    children: Vec<WorkItemTreeNode>,
}

impl<'a> Frame<'a> {
    fn new(item: WorkItem, children_of: &'a HashMap<i64, Vec<i64>>) -> Self {
        let pending = children_of
            .get(&item.id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter();
        Self {
            item,
            pending,
            children: Vec::new(),
        }
    }

    fn next_child(
        &mut self,
        nodes: &HashMap<i64, WorkItem>,
        on_path: &HashSet<i64>,
    ) -> Option<WorkItem> {
        self.pending.by_ref().find_map(|id| {
            if on_path.contains(id) {
                None
            } else {
                nodes.get(id).cloned()
            }
        })
    }

    fn finish(self) -> WorkItemTreeNode {
        WorkItemTreeNode {
            work_item: self.item,
            children: self.children,
        }
    }
}

// Depth-first with an explicit ancestor stack so chain length never touches
// the call stack.
fn assemble(
    root: WorkItem,
    nodes: &HashMap<i64, WorkItem>,
    children_of: &HashMap<i64, Vec<i64>>,
) -> WorkItemTreeNode {
    let mut on_path = HashSet::from([root.id]);
    let mut current = Frame::new(root, children_of);
    let mut ancestors: Vec<Frame<'_>> = Vec::new();
    loop {
        if let Some(child) = current.next_child(nodes, &on_path) {
            on_path.insert(child.id);
            let child_frame = Frame::new(child, children_of);
            ancestors.push(std::mem::replace(&mut current, child_frame));
            continue;
        }
        on_path.remove(&current.item.id);
        let node = current.finish();
        match ancestors.pop() {
            Some(mut parent) => {
                parent.children.push(node);
                current = parent;
            }
            None => return node,
        }
    }
}

/// Total number of nodes in a forest.
pub fn count_nodes(forest: &[WorkItemTreeNode]) -> usize {
    let mut count = 0;
    let mut stack: Vec<&WorkItemTreeNode> = forest.iter().collect();
    while let Some(node) = stack.pop() {
        count += 1;
        stack.extend(node.children.iter());
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64) -> WorkItem {
        WorkItem {
            id,
            title: format!("Item {id}"),
            ..WorkItem::default()
        }
    }

    fn items(ids: &[i64]) -> Vec<WorkItem> {
        ids.iter().copied().map(item).collect()
    }

    fn edges(pairs: &[(i64, i64)]) -> Vec<RelationEdge> {
        pairs
            .iter()
            .map(|&(source, target)| RelationEdge::new(source, target))
            .collect()
    }

    fn child_ids(node: &WorkItemTreeNode) -> Vec<i64> {
        node.children.iter().map(|c| c.work_item.id).collect()
    }

    fn all_ids(forest: &[WorkItemTreeNode]) -> Vec<i64> {
        let mut ids = Vec::new();
        let mut stack: Vec<&WorkItemTreeNode> = forest.iter().collect();
        while let Some(node) = stack.pop() {
            ids.push(node.work_item.id);
            stack.extend(node.children.iter());
        }
        ids
    }

    #[test]
    fn builds_single_rooted_hierarchy() {
        let forest = build_forest(&edges(&[(1, 2), (1, 3), (2, 4)]), items(&[1, 2, 3, 4]));
        assert_eq!(forest.len(), 1);
        let root = &forest[0];
        assert_eq!(root.work_item.id, 1);
        assert_eq!(child_ids(root), vec![2, 3]);
        assert_eq!(child_ids(&root.children[0]), vec![4]);
        assert!(root.children[1].children.is_empty());
        assert_eq!(all_ids(&forest).iter().filter(|&&id| id == 4).count(), 1);
        assert_eq!(count_nodes(&forest), 4);
    }

    #[test]
    fn pure_cycle_is_dropped() {
        let forest = build_forest(&edges(&[(1, 2), (2, 1)]), items(&[1, 2]));
        assert!(forest.is_empty());
    }

    #[test]
    fn cycle_below_a_root_terminates() {
        let forest = build_forest(&edges(&[(1, 2), (2, 3), (3, 2)]), items(&[1, 2, 3]));
        assert_eq!(forest.len(), 1);
        assert_eq!(count_nodes(&forest), 3);
        assert_eq!(child_ids(&forest[0].children[0]), vec![3]);
        assert!(forest[0].children[0].children[0].children.is_empty());
    }

    #[test]
    fn dangling_child_is_skipped() {
        let forest = build_forest(&edges(&[(1, 2), (1, 99)]), items(&[1, 2]));
        assert_eq!(forest.len(), 1);
        assert_eq!(child_ids(&forest[0]), vec![2]);
    }

    #[test]
    fn unlinked_items_are_roots_in_input_order() {
        let forest = build_forest(&edges(&[(5, 6)]), items(&[7, 5, 6, 3]));
        let roots: Vec<i64> = forest.iter().map(|n| n.work_item.id).collect();
        assert_eq!(roots, vec![7, 5, 3]);
    }

    #[test]
    fn shared_child_appears_under_every_parent() {
        let forest = build_forest(&edges(&[(1, 3), (2, 3)]), items(&[1, 2, 3]));
        assert_eq!(forest.len(), 2);
        assert_eq!(child_ids(&forest[0]), vec![3]);
        assert_eq!(child_ids(&forest[1]), vec![3]);
        assert_eq!(count_nodes(&forest), 4);
    }

    #[test]
    fn duplicate_edges_repeat_the_child() {
        let forest = build_forest(&edges(&[(1, 3), (2, 3), (1, 3)]), items(&[1, 2, 3]));
        assert_eq!(forest.len(), 2);
        assert_eq!(child_ids(&forest[0]), vec![3, 3]);
        assert_eq!(child_ids(&forest[1]), vec![3]);
    }

    #[test]
    fn shared_subtree_is_copied_whole() {
        let forest = build_forest(
            &edges(&[(1, 2), (1, 3), (2, 4), (3, 4), (4, 5)]),
            items(&[1, 2, 3, 4, 5]),
        );
        assert_eq!(forest.len(), 1);
        let root = &forest[0];
        assert_eq!(child_ids(&root.children[0]), vec![4]);
        assert_eq!(child_ids(&root.children[1]), vec![4]);
        assert_eq!(child_ids(&root.children[0].children[0]), vec![5]);
        assert_eq!(child_ids(&root.children[1].children[0]), vec![5]);
        assert_eq!(count_nodes(&forest), 7);
    }

    #[test]
    fn repeated_item_keeps_first_record() {
        let mut input = items(&[1, 2]);
        input.push(WorkItem {
            id: 1,
            title: "duplicate".into(),
            ..WorkItem::default()
        });
        let forest = build_forest(&[], input);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].work_item.title, "Item 1");
    }

    #[test]
    fn long_chain_does_not_overflow() {
        let depth = 50_000;
        let ids: Vec<i64> = (0..depth).collect();
        let pairs: Vec<(i64, i64)> = (1..depth).map(|id| (id - 1, id)).collect();
        let forest = build_forest(&edges(&pairs), items(&ids));
        assert_eq!(forest.len(), 1);
        assert_eq!(count_nodes(&forest), depth as usize);
        // Unwind iteratively; the derived Drop would recurse once per level.
        let mut pending = forest;
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let forest = build_forest(&edges(&[(1, 2)]), items(&[1, 2]));
        let json = serde_json::to_value(&forest).unwrap();
        assert_eq!(json[0]["workItem"]["id"], 1);
        assert_eq!(json[0]["children"][0]["workItem"]["id"], 2);
    }
}
