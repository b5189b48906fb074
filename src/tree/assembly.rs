use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use eframe::egui::{pos2, Pos2, Rect};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{child_id, DendrogramIndex, DendrogramNode, NodeId, ROOT_ID};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Typed layout constants, in CSS pixels at zoom level 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutTokens {
    pub padding: f32,
    pub row_height: f32,
    /// Width of the clickable band to the right of a leaf (its label area).
    pub label_band: f32,
    pub node_radius: f32,
}

impl Default for LayoutTokens {
    fn default() -> Self {
        Self {
            padding: 20.0,
            row_height: 24.0,
            label_band: 160.0,
            node_radius: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderNode {
    pub id: NodeId,
    /// Sequential leaf slot; internal nodes span the rows of their children.
    pub row_index: Option<usize>,
    pub row: f32,
    pub pixel_x: f32,
    pub branch_length: Decimal,
    pub cumulative_distance: Decimal,
    pub subtree_leaf_names: Vec<String>,
    pub subtree_max_branch_length: Decimal,
    pub children: Vec<usize>,
    pub parent: Option<usize>,
}

impl RenderNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    /// Horizontal segment from the parent's x to the node's x.
    Branch,
    /// Vertical segment spanning the children's rows.
    Connector,
    /// The junction point (or tip) of the node itself.
    Node,
    /// Label band to the right of a leaf.
    Label,
}

/// Assembly-space rectangle mapped to a node, zoom level 1, unscrolled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitRegion {
    pub rect: Rect,
    pub node: usize,
    pub kind: HitKind,
}

/// Flattened, pixel-positioned render model of a dendrogram.
#[derive(Debug, Clone)]
pub struct TreeAssembly {
    pub nodes: Vec<RenderNode>,
    pub root: Option<usize>,
    pub leaf_count: usize,
    pub canvas_width: f32,
    pub pixels_per_unit: f32,
    pub max_distance: Decimal,
    pub tokens: LayoutTokens,
    pub generation: u64,
    pub hit_regions: Vec<HitRegion>,
    ids: HashMap<NodeId, usize>,
}

impl TreeAssembly {
    fn empty(canvas_width: f32, pixels_per_unit: f32, tokens: LayoutTokens) -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            leaf_count: 0,
            canvas_width,
            pixels_per_unit,
            max_distance: Decimal::ZERO,
            tokens,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            hit_regions: Vec::new(),
            ids: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<&RenderNode> {
        self.root.and_then(|index| self.nodes.get(index))
    }

    pub fn node(&self, index: usize) -> Option<&RenderNode> {
        self.nodes.get(index)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.ids.get(id).copied()
    }

    pub fn node_by_id(&self, id: &str) -> Option<&RenderNode> {
        self.index_of(id).and_then(|index| self.nodes.get(index))
    }

    /// Leaves ordered by row.
    pub fn leaves(&self) -> impl Iterator<Item = &RenderNode> {
        let mut leaves: Vec<&RenderNode> = self.nodes.iter().filter(|n| n.is_leaf()).collect();
        leaves.sort_by_key(|n| n.row_index);
        leaves.into_iter()
    }

    /// Vertical centre of a row in assembly pixels.
    pub fn row_y(&self, row: f32) -> f32 {
        (row + 0.5) * self.tokens.row_height
    }

    pub fn node_pos(&self, node: &RenderNode) -> Pos2 {
        pos2(node.pixel_x, self.row_y(node.row))
    }

    pub fn content_height(&self) -> f32 {
        self.leaf_count as f32 * self.tokens.row_height
    }

    pub fn parent_x(&self, node: &RenderNode) -> f32 {
        node.parent
            .and_then(|p| self.nodes.get(p))
            .map(|p| p.pixel_x)
            .unwrap_or(node.pixel_x)
    }
}

/// `(width − 2·padding) / max_distance`, the ratio that fits the tree into the canvas.
pub fn fit_ratio(canvas_width_px: f32, padding: f32, max_distance: Decimal) -> Option<f32> {
    let distance = max_distance.to_f32()?;
    let usable = canvas_width_px - 2.0 * padding;
    if distance <= 0.0 || usable <= 0.0 {
        return None;
    }
    Some(usable / distance)
}

/// Build the render model for the whole dendrogram.
pub fn assemble(
    dendrogram: &DendrogramNode,
    canvas_width_px: f32,
    pixels_per_distance_unit: f32,
    tokens: &LayoutTokens,
) -> TreeAssembly {
    let root_id = if dendrogram.is_leaf() {
        dendrogram.name.clone().unwrap_or_default()
    } else {
        ROOT_ID.to_string()
    };
    build(
        dendrogram,
        root_id,
        canvas_width_px,
        pixels_per_distance_unit,
        tokens,
    )
}

/// Build the render model for the subtree rooted at `root_id` of the
/// unfiltered dendrogram, keeping the unfiltered node ids.
pub fn assemble_subtree(
    unfiltered: &DendrogramNode,
    index: &DendrogramIndex,
    root_id: &str,
    canvas_width_px: f32,
    pixels_per_distance_unit: f32,
    tokens: &LayoutTokens,
) -> Option<TreeAssembly> {
    let subtree = index.resolve(unfiltered, root_id)?;
    Some(build(
        subtree,
        root_id.to_string(),
        canvas_width_px,
        pixels_per_distance_unit,
        tokens,
    ))
}

struct AssemblyState<'a> {
    next_row: usize,
    nodes: Vec<RenderNode>,
    ids: HashMap<NodeId, usize>,
    canvas_width: f32,
    ratio: f32,
    tokens: &'a LayoutTokens,
}

impl AssemblyState<'_> {
    fn to_pixel_x(&self, cumulative: Decimal) -> f32 {
        let padding = self.tokens.padding;
        let upper = (self.canvas_width - padding).max(padding);
        let x = padding + cumulative.to_f32().unwrap_or(0.0) * self.ratio;
        x.max(padding).min(upper)
    }
}

fn build(
    root: &DendrogramNode,
    root_id: NodeId,
    canvas_width_px: f32,
    ratio: f32,
    tokens: &LayoutTokens,
) -> TreeAssembly {
    let mut assembly = TreeAssembly::empty(canvas_width_px, ratio, *tokens);
    let unnamed_leaf = root.is_leaf() && root.name.as_deref().map_or(true, str::is_empty);
    if unnamed_leaf {
        return assembly;
    }

    let mut state = AssemblyState {
        next_row: 0,
        nodes: Vec::with_capacity(root.leaf_count() * 2),
        ids: HashMap::new(),
        canvas_width: canvas_width_px,
        ratio,
        tokens,
    };
    let root_index = assign_positions(root, root_id, None, Decimal::ZERO, &mut state);

    let mut regions = Vec::with_capacity(state.nodes.len() * 3);
    for index in 0..state.nodes.len() {
        push_hit_regions(&state, index, &mut regions);
    }

    assembly.max_distance = state.nodes[root_index].subtree_max_branch_length;
    assembly.leaf_count = state.next_row;
    assembly.root = Some(root_index);
    assembly.nodes = state.nodes;
    assembly.hit_regions = regions;
    assembly.ids = state.ids;
    assembly
}

fn assign_positions(
    node: &DendrogramNode,
    id: NodeId,
    parent: Option<usize>,
    cumulative: Decimal,
    state: &mut AssemblyState<'_>,
) -> usize {
    let index = state.nodes.len();
    let pixel_x = state.to_pixel_x(cumulative);
    state.nodes.push(RenderNode {
        id: id.clone(),
        row_index: None,
        row: 0.0,
        pixel_x,
        branch_length: if parent.is_some() {
            node.branch_length
        } else {
            Decimal::ZERO
        },
        cumulative_distance: cumulative,
        subtree_leaf_names: Vec::new(),
        subtree_max_branch_length: Decimal::ZERO,
        children: Vec::new(),
        parent,
    });
    state.ids.insert(id.clone(), index);

    if node.is_leaf() {
        let row = state.next_row;
        state.next_row += 1;
        let entry = &mut state.nodes[index];
        entry.row_index = Some(row);
        entry.row = row as f32;
        entry.subtree_leaf_names = vec![id];
        return index;
    }

    let mut first_row = f32::MAX;
    let mut last_row = f32::MIN;
    let mut children = Vec::with_capacity(node.children.len());
    let mut leaf_names = Vec::new();
    let mut max_below = Decimal::ZERO;

    for (position, child) in node.children.iter().enumerate() {
        let child_cumulative = cumulative + child.branch_length;
        let child_index = assign_positions(
            child,
            child_id(&id, position, child),
            Some(index),
            child_cumulative,
            state,
        );
        let child_node = &state.nodes[child_index];
        first_row = first_row.min(child_node.row);
        last_row = last_row.max(child_node.row);
        leaf_names.extend(child_node.subtree_leaf_names.iter().cloned());
        max_below = max_below.max(child.branch_length + child_node.subtree_max_branch_length);
        children.push(child_index);
    }

    let entry = &mut state.nodes[index];
    entry.row = if first_row.is_finite() && last_row.is_finite() {
        (first_row + last_row) / 2.0
    } else {
        0.0
    };
    entry.children = children;
    entry.subtree_leaf_names = leaf_names;
    entry.subtree_max_branch_length = max_below;
    index
}

fn push_hit_regions(state: &AssemblyState<'_>, index: usize, regions: &mut Vec<HitRegion>) {
    let row_height = state.tokens.row_height;
    let node = &state.nodes[index];
    let y = (node.row + 0.5) * row_height;
    let point = pos2(node.pixel_x, y);

    if let Some(parent) = node.parent {
        let parent_x = state.nodes[parent].pixel_x;
        regions.push(HitRegion {
            rect: Rect::from_two_pos(pos2(parent_x, y), point),
            node: index,
            kind: HitKind::Branch,
        });
    }

    regions.push(HitRegion {
        rect: Rect::from_min_max(point, point),
        node: index,
        kind: HitKind::Node,
    });

    if node.is_leaf() {
        regions.push(HitRegion {
            rect: Rect::from_min_max(
                pos2(node.pixel_x, y - row_height / 2.0),
                pos2(node.pixel_x + state.tokens.label_band, y + row_height / 2.0),
            ),
            node: index,
            kind: HitKind::Label,
        });
    } else if node.children.len() > 1 {
        let first = &state.nodes[node.children[0]];
        let last = &state.nodes[node.children[node.children.len() - 1]];
        regions.push(HitRegion {
            rect: Rect::from_two_pos(
                pos2(node.pixel_x, (first.row + 0.5) * row_height),
                pos2(node.pixel_x, (last.row + 0.5) * row_height),
            ),
            node: index,
            kind: HitKind::Connector,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::sample_tree;

    fn sample_assembly() -> TreeAssembly {
        let tokens = LayoutTokens::default();
        let tree = sample_tree();
        let ratio = fit_ratio(400.0, tokens.padding, tree.max_leaf_distance()).unwrap();
        assemble(&tree, 400.0, ratio, &tokens)
    }

    #[test]
    fn fit_ratio_matches_worked_example() {
        let ratio = fit_ratio(400.0, 20.0, Decimal::new(3, 0)).unwrap();
        assert!((ratio - 120.0).abs() < 1e-4);
        assert!(fit_ratio(400.0, 20.0, Decimal::ZERO).is_none());
        assert!(fit_ratio(30.0, 20.0, Decimal::ONE).is_none());
    }

    #[test]
    fn root_sits_on_padding_and_leaf_a_at_260() {
        let assembly = sample_assembly();
        let root = assembly.root().unwrap();
        assert_eq!(root.id, ROOT_ID);
        assert!((root.pixel_x - 20.0).abs() < 1e-4);

        let a = assembly.node_by_id("A").unwrap();
        assert_eq!(a.cumulative_distance, Decimal::new(2, 0));
        assert!((a.pixel_x - 260.0).abs() < 1e-3);

        let b = assembly.node_by_id("B").unwrap();
        assert!((b.pixel_x - 380.0).abs() < 1e-3);
        assert!(assembly.nodes.iter().all(|n| n.pixel_x <= 380.0 + 1e-3));
    }

    #[test]
    fn leaves_get_contiguous_rows() {
        let assembly = sample_assembly();
        let rows: Vec<usize> = assembly.leaves().filter_map(|n| n.row_index).collect();
        assert_eq!(rows, vec![0, 1, 2, 3]);
        assert_eq!(assembly.leaf_count, 4);
        let names: Vec<&str> = assembly.leaves().map(|n| n.id.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn internal_nodes_centre_on_children() {
        let assembly = sample_assembly();
        let left = assembly.node_by_id("node:root/0").unwrap();
        assert!((left.row - 0.5).abs() < 1e-6);
        let root = assembly.root().unwrap();
        assert!((root.row - 1.5).abs() < 1e-6);
        assert_eq!(left.subtree_leaf_names, vec!["A", "B"]);
        assert_eq!(root.subtree_leaf_names, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn subtree_max_branch_length_is_distance_to_deepest_leaf() {
        let assembly = sample_assembly();
        assert_eq!(assembly.root().unwrap().subtree_max_branch_length, Decimal::new(3, 0));
        assert_eq!(
            assembly.node_by_id("node:root/1").unwrap().subtree_max_branch_length,
            Decimal::ONE
        );
        assert_eq!(assembly.max_distance, Decimal::new(3, 0));
    }

    #[test]
    fn subtree_assembly_keeps_unfiltered_ids() {
        let tree = sample_tree();
        let index = DendrogramIndex::build(&tree);
        let tokens = LayoutTokens::default();
        let assembly =
            assemble_subtree(&tree, &index, "node:root/1", 400.0, 120.0, &tokens).unwrap();
        assert_eq!(assembly.root().unwrap().id, "node:root/1");
        assert_eq!(assembly.leaf_count, 2);
        let c = assembly.node_by_id("C").unwrap();
        assert_eq!(c.row_index, Some(0));
        assert!((c.pixel_x - 140.0).abs() < 1e-3);
        assert!(assemble_subtree(&tree, &index, "node:missing", 400.0, 1.0, &tokens).is_none());
    }

    #[test]
    fn empty_dendrogram_yields_empty_assembly() {
        let empty = DendrogramNode::internal(Decimal::ZERO, Vec::new());
        let assembly = assemble(&empty, 400.0, 1.0, &LayoutTokens::default());
        assert!(assembly.is_empty());
        assert_eq!(assembly.leaf_count, 0);
        assert!(assembly.root().is_none());
    }

    #[test]
    fn every_assembly_gets_a_fresh_generation() {
        let first = sample_assembly();
        let second = sample_assembly();
        assert_ne!(first.generation, second.generation);
    }

    #[test]
    fn hit_regions_cover_branches_connectors_and_labels() {
        let assembly = sample_assembly();
        let count = |kind| assembly.hit_regions.iter().filter(|r| r.kind == kind).count();
        assert_eq!(count(HitKind::Branch), 6);
        assert_eq!(count(HitKind::Node), 7);
        assert_eq!(count(HitKind::Label), 4);
        assert_eq!(count(HitKind::Connector), 3);
    }
}
