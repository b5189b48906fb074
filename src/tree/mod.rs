use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod assembly;
pub mod filter;
pub mod interaction;
pub mod painter;
pub mod prefs;
pub mod scale;
pub mod skia_renderer;
pub mod viewer;
pub mod viewport;

/// Leaf name for leaves, synthetic path id (`node:root/0/1`) for internal nodes.
pub type NodeId = String;

pub const INTERNAL_ID_PREFIX: &str = "node:";
pub const ROOT_ID: &str = "node:root";

/// Input dendrogram node as produced by the clustering service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DendrogramNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub branch_length: Decimal,
    #[serde(default)]
    pub children: Vec<DendrogramNode>,
}

impl DendrogramNode {
    pub fn leaf(name: impl Into<String>, branch_length: Decimal) -> Self {
        Self {
            name: Some(name.into()),
            branch_length,
            children: Vec::new(),
        }
    }

    pub fn internal(branch_length: Decimal, children: Vec<DendrogramNode>) -> Self {
        Self {
            name: None,
            branch_length,
            children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Leaf names in dendrogram (top-to-bottom) order.
    pub fn leaf_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.is_leaf() {
                if let Some(name) = &node.name {
                    names.push(name.clone());
                }
            } else {
                stack.extend(node.children.iter().rev());
            }
        }
        names
    }

    pub fn leaf_count(&self) -> usize {
        if self.is_leaf() {
            return 1;
        }
        self.children.iter().map(DendrogramNode::leaf_count).sum()
    }

    /// Largest cumulative branch length from this node down to any leaf.
    pub fn max_leaf_distance(&self) -> Decimal {
        self.children
            .iter()
            .map(|child| child.branch_length + child.max_leaf_distance())
            .max()
            .unwrap_or(Decimal::ZERO)
    }

    /// Every leaf must carry a unique, non-empty name outside the synthetic
    /// `node:` id namespace, and no branch may be negative.
    pub fn check_leaves(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.branch_length.is_sign_negative() && !node.branch_length.is_zero() {
                return Err(format!("negative branch length {}", node.branch_length));
            }
            if node.is_leaf() {
                let name = node.name.as_deref().unwrap_or("");
                if name.is_empty() {
                    return Err("leaf without a name".to_string());
                }
                if name.starts_with(INTERNAL_ID_PREFIX) {
                    return Err(format!("leaf name {name:?} uses the reserved {INTERNAL_ID_PREFIX:?} prefix"));
                }
                if !seen.insert(name) {
                    return Err(format!("duplicate leaf name {name:?}"));
                }
            } else {
                stack.extend(node.children.iter());
            }
        }
        Ok(())
    }

    pub fn child_at_path(&self, path: &[usize]) -> Option<&DendrogramNode> {
        let mut current = self;
        for &index in path {
            current = current.children.get(index)?;
        }
        Some(current)
    }

    /// Bracket-notation (Newick) text for this subtree, terminated by `;`.
    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        self.write_newick(&mut out);
        out.push(';');
        out
    }

    fn write_newick(&self, out: &mut String) {
        if !self.children.is_empty() {
            out.push('(');
            for (index, child) in self.children.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                child.write_newick(out);
            }
            out.push(')');
        }
        if let Some(name) = &self.name {
            out.push_str(&quote_newick_label(name));
        }
        out.push(':');
        out.push_str(&self.branch_length.normalize().to_string());
    }
}

fn quote_newick_label(name: &str) -> String {
    let needs_quotes = name
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '\'' | ':' | ';' | ','));
    if needs_quotes {
        format!("'{}'", name.replace('\'', "''"))
    } else {
        name.to_string()
    }
}

/// Recover the decimal a float was parsed from (shortest round-trip form),
/// so lengths read as `0.1` stay exactly `0.1`.
pub fn decimal_from_f64(value: f64) -> Decimal {
    if !value.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::from_str(&value.to_string())
        .ok()
        .or_else(|| Decimal::from_f64(value))
        .unwrap_or(Decimal::ZERO)
}

pub fn child_id(parent: &str, index: usize, child: &DendrogramNode) -> NodeId {
    if child.is_leaf() {
        child.name.clone().unwrap_or_default()
    } else {
        format!("{parent}/{index}")
    }
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub parent: Option<NodeId>,
    /// Position among the parent's children.
    pub position: usize,
    pub child_count: usize,
    pub leaf_names: Vec<String>,
}

/// Ancestry lookup over the unfiltered tree, keyed by [`NodeId`].
#[derive(Debug, Clone, Default)]
pub struct DendrogramIndex {
    entries: HashMap<NodeId, IndexEntry>,
}

impl DendrogramIndex {
    pub fn build(root: &DendrogramNode) -> Self {
        let mut entries = HashMap::new();

        fn visit(
            node: &DendrogramNode,
            id: NodeId,
            parent: Option<NodeId>,
            position: usize,
            entries: &mut HashMap<NodeId, IndexEntry>,
        ) -> Vec<String> {
            let leaf_names = if node.is_leaf() {
                vec![id.clone()]
            } else {
                let mut names = Vec::new();
                for (index, child) in node.children.iter().enumerate() {
                    names.extend(visit(
                        child,
                        child_id(&id, index, child),
                        Some(id.clone()),
                        index,
                        entries,
                    ));
                }
                names
            };
            entries.insert(
                id,
                IndexEntry {
                    parent,
                    position,
                    child_count: node.children.len(),
                    leaf_names: leaf_names.clone(),
                },
            );
            leaf_names
        }

        let root_id = if root.is_leaf() {
            root.name.clone().unwrap_or_default()
        } else {
            ROOT_ID.to_string()
        };
        visit(root, root_id, None, 0, &mut entries);
        Self { entries }
    }

    /// Child positions from the root down to `id`.
    pub fn path(&self, id: &str) -> Option<Vec<usize>> {
        let mut path = Vec::new();
        let mut entry = self.entries.get(id)?;
        while let Some(parent) = entry.parent.as_deref() {
            path.push(entry.position);
            entry = self.entries.get(parent)?;
        }
        path.reverse();
        Some(path)
    }

    /// The node `id` names inside `root`, the tree this index was built from.
    pub fn resolve<'a>(&self, root: &'a DendrogramNode, id: &str) -> Option<&'a DendrogramNode> {
        root.child_at_path(&self.path(id)?)
    }

    /// Whether `id` is `ancestor` or lies below it.
    pub fn is_within(&self, id: &str, ancestor: &str) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.entries.get(node).and_then(|entry| entry.parent.as_deref());
        }
        false
    }

    pub fn get(&self, id: &str) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nearest ancestor that has at least two children, or the root.
    ///
    /// Unary ancestors are skipped: stepping out to them would show the same
    /// leaf set again.
    pub fn branching_ancestor(&self, id: &str) -> Option<&str> {
        let mut current = self.entries.get(id)?.parent.as_deref()?;
        loop {
            let entry = self.entries.get(current)?;
            match entry.parent.as_deref() {
                Some(parent) if entry.child_count < 2 => current = parent,
                _ => return Some(current),
            }
        }
    }

    pub fn is_root(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|entry| entry.parent.is_none())
            .unwrap_or(false)
    }
}

/// A tree loaded from a file, before it is handed to the engine.
#[derive(Debug, Clone)]
pub struct LoadedTree {
    pub id: usize,
    pub label: Option<String>,
    pub newick: String,
    pub dendrogram: DendrogramNode,
}

impl LoadedTree {
    pub fn leaf_count(&self) -> usize {
        self.dendrogram.leaf_count()
    }
}

/// Container for the full contents of an imported file.
#[derive(Debug, Clone)]
pub struct TreeBundle {
    pub format: TreeFileFormat,
    pub trees: Vec<LoadedTree>,
    pub metadata: BTreeMap<String, String>,
}

impl TreeBundle {
    pub fn new(format: TreeFileFormat, trees: Vec<LoadedTree>) -> Self {
        Self {
            format,
            trees,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TreeFileFormat {
    Newick,
    Nexus,
    Json,
}

#[cfg(test)]
pub(crate) fn sample_tree() -> DendrogramNode {
    // ((A:1,B:2):1,(C:1,D:1):2):0
    let d = |v: i64| Decimal::new(v, 0);
    DendrogramNode::internal(
        d(0),
        vec![
            DendrogramNode::internal(
                d(1),
                vec![DendrogramNode::leaf("A", d(1)), DendrogramNode::leaf("B", d(2))],
            ),
            DendrogramNode::internal(
                d(2),
                vec![DendrogramNode::leaf("C", d(1)), DendrogramNode::leaf("D", d(1))],
            ),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_names_follow_dendrogram_order() {
        let tree = sample_tree();
        assert_eq!(tree.leaf_names(), vec!["A", "B", "C", "D"]);
        assert_eq!(tree.leaf_count(), 4);
    }

    #[test]
    fn max_leaf_distance_is_longest_root_path() {
        assert_eq!(sample_tree().max_leaf_distance(), Decimal::new(3, 0));
    }

    #[test]
    fn writes_newick_with_root_length() {
        assert_eq!(sample_tree().to_newick(), "((A:1,B:2):1,(C:1,D:1):2):0;");
    }

    #[test]
    fn quotes_labels_with_reserved_characters() {
        let tree = DendrogramNode::internal(
            Decimal::ZERO,
            vec![
                DendrogramNode::leaf("case 1", Decimal::new(5, 1)),
                DendrogramNode::leaf("O'Brien", Decimal::new(25, 2)),
            ],
        );
        assert_eq!(tree.to_newick(), "('case 1':0.5,'O''Brien':0.25):0;");
    }

    #[test]
    fn recovers_exact_decimals_from_floats() {
        assert_eq!(decimal_from_f64(0.1), Decimal::new(1, 1));
        assert_eq!(decimal_from_f64(0.000_123), Decimal::new(123, 6));
        assert_eq!(decimal_from_f64(f64::NAN), Decimal::ZERO);
    }

    #[test]
    fn rejects_duplicate_and_empty_leaf_names() {
        let dup = DendrogramNode::internal(
            Decimal::ZERO,
            vec![
                DendrogramNode::leaf("A", Decimal::ONE),
                DendrogramNode::leaf("A", Decimal::ONE),
            ],
        );
        assert!(dup.check_leaves().is_err());

        let unnamed = DendrogramNode::internal(
            Decimal::ZERO,
            vec![
                DendrogramNode::leaf("A", Decimal::ONE),
                DendrogramNode::leaf("", Decimal::ONE),
            ],
        );
        assert!(unnamed.check_leaves().is_err());
        let reserved = DendrogramNode::internal(
            Decimal::ZERO,
            vec![
                DendrogramNode::leaf("node:root/0", Decimal::ONE),
                DendrogramNode::leaf("B", Decimal::ONE),
            ],
        );
        assert!(reserved.check_leaves().unwrap_err().contains("reserved"));
        assert!(sample_tree().check_leaves().is_ok());
    }

    #[test]
    fn deserializes_lengths_from_numbers_and_strings() {
        let json = r#"{"branchLength": 0, "children": [
            {"name": "A", "branchLength": "0.1"},
            {"name": "B", "branchLength": 0.25}
        ]}"#;
        let tree: DendrogramNode = serde_json::from_str(json).unwrap();
        assert_eq!(tree.children[0].branch_length, Decimal::new(1, 1));
        assert_eq!(tree.children[1].branch_length, Decimal::new(25, 2));
    }

    #[test]
    fn index_resolves_parents_and_paths() {
        let index = DendrogramIndex::build(&sample_tree());
        assert_eq!(index.len(), 7);
        assert!(index.is_root(ROOT_ID));

        let left = index.get("node:root/0").unwrap();
        assert_eq!(index.path("node:root/0"), Some(vec![0]));
        assert_eq!(index.path("D"), Some(vec![1, 1]));
        assert_eq!(index.path(ROOT_ID), Some(vec![]));
        let tree = sample_tree();
        let right = index.resolve(&tree, "node:root/1").unwrap();
        assert_eq!(right.leaf_names(), vec!["C", "D"]);
        assert!(index.is_within("D", "node:root/1"));
        assert!(!index.is_within("A", "node:root/1"));
        assert_eq!(left.leaf_names, vec!["A", "B"]);
        assert_eq!(left.parent.as_deref(), Some(ROOT_ID));

        assert_eq!(index.get("C").unwrap().parent.as_deref(), Some("node:root/1"));
    }

    #[test]
    fn branching_ancestor_skips_unary_nodes() {
        // ((((A:1,B:1):1):1,C:1):0 — the clade (A,B) sits under a unary node.
        let d = Decimal::ONE;
        let tree = DendrogramNode::internal(
            Decimal::ZERO,
            vec![
                DendrogramNode::internal(
                    d,
                    vec![DendrogramNode::internal(
                        d,
                        vec![DendrogramNode::leaf("A", d), DendrogramNode::leaf("B", d)],
                    )],
                ),
                DendrogramNode::leaf("C", d),
            ],
        );
        let index = DendrogramIndex::build(&tree);
        assert_eq!(index.get("node:root/0").unwrap().child_count, 1);
        assert_eq!(index.branching_ancestor("node:root/0/0"), Some(ROOT_ID));
        assert_eq!(index.branching_ancestor(ROOT_ID), None);
    }
}
