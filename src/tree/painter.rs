use std::collections::{HashMap, HashSet};

use eframe::egui::{Color32, Stroke};
use rust_decimal::Decimal;

use super::assembly::TreeAssembly;

/// Colors, strokes and type sizes of the tree surfaces, in CSS pixels.
#[derive(Debug, Clone)]
pub struct TreePainter {
    pub branch_stroke: Stroke,
    pub branch_highlight_stroke: Stroke,
    pub background_color: Color32,
    pub header_background_color: Color32,
    pub label_color: Color32,
    pub branch_label_color: Color32,
    pub guide_color: Color32,
    pub divider_color: Color32,
    pub tick_label_color: Color32,
    pub unavailable_color: Color32,
    pub label_font_size: f32,
    pub branch_label_font_size: f32,
    pub tick_font_size: f32,
    pub scale_bar_line_width: f32,
    /// Gap between a leaf tip and its name.
    pub label_gap: f32,
    pub branch_label_precision: u32,
}

impl Default for TreePainter {
    fn default() -> Self {
        Self {
            branch_stroke: Stroke::new(1.5, Color32::from_gray(40)),
            branch_highlight_stroke: Stroke::new(3.5, Color32::from_rgb(96, 186, 255)),
            background_color: Color32::WHITE,
            header_background_color: Color32::from_gray(250),
            label_color: Color32::BLACK,
            branch_label_color: Color32::from_gray(90),
            guide_color: Color32::from_gray(225),
            divider_color: Color32::from_gray(200),
            tick_label_color: Color32::from_gray(70),
            unavailable_color: Color32::from_gray(150),
            label_font_size: 12.0,
            branch_label_font_size: 10.0,
            tick_font_size: 10.0,
            scale_bar_line_width: 2.0,
            label_gap: 4.0,
            branch_label_precision: 4,
        }
    }
}

impl TreePainter {
    pub fn set_highlight_color(&mut self, color: Color32) {
        self.branch_highlight_stroke.color = color;
    }

    pub fn branch_label_text(&self, length: Decimal) -> String {
        length
            .round_dp(self.branch_label_precision)
            .normalize()
            .to_string()
    }

    /// Stroke for a node given its stratification color and highlight flag.
    pub fn stroke_for(&self, group: Option<Color32>, highlighted: bool) -> Stroke {
        if highlighted {
            self.branch_highlight_stroke
        } else if let Some(color) = group {
            Stroke::new(self.branch_stroke.width, color)
        } else {
            self.branch_stroke
        }
    }
}

/// Group color per node: a subtree takes its leaves' color only when every
/// leaf below it maps to that same color.
pub fn subtree_colors(
    assembly: &TreeAssembly,
    groups: &HashMap<String, Color32>,
) -> Vec<Option<Color32>> {
    if groups.is_empty() {
        return vec![None; assembly.nodes.len()];
    }
    // Children always sit after their parent in the arena.
    let mut colors = vec![None; assembly.nodes.len()];
    for index in (0..assembly.nodes.len()).rev() {
        let node = &assembly.nodes[index];
        colors[index] = if node.is_leaf() {
            groups.get(&node.id).copied()
        } else {
            let mut shared = None;
            let mut uniform = true;
            for &child in &node.children {
                match (colors[child], shared) {
                    (None, _) => uniform = false,
                    (Some(color), None) => shared = Some(color),
                    (Some(color), Some(seen)) if color != seen => uniform = false,
                    _ => {}
                }
            }
            if uniform {
                shared
            } else {
                None
            }
        };
    }
    colors
}

/// Whether each node's subtree contains a highlighted leaf.
pub fn highlighted_nodes(assembly: &TreeAssembly, highlighted: &HashSet<String>) -> Vec<bool> {
    let mut flags = vec![false; assembly.nodes.len()];
    if highlighted.is_empty() {
        return flags;
    }
    for index in (0..assembly.nodes.len()).rev() {
        let node = &assembly.nodes[index];
        flags[index] = if node.is_leaf() {
            highlighted.contains(&node.id)
        } else {
            node.children.iter().any(|&child| flags[child])
        };
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::assembly::{assemble, LayoutTokens};
    use crate::tree::sample_tree;

    fn assembly() -> TreeAssembly {
        assemble(&sample_tree(), 400.0, 120.0, &LayoutTokens::default())
    }

    #[test]
    fn subtree_takes_group_color_only_when_uniform() {
        let assembly = assembly();
        let red = Color32::RED;
        let groups: HashMap<String, Color32> = [("A", red), ("B", red), ("C", red), ("D", Color32::BLUE)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let colors = subtree_colors(&assembly, &groups);
        let color_of = |id: &str| colors[assembly.index_of(id).unwrap()];
        assert_eq!(color_of("node:root/0"), Some(red));
        assert_eq!(color_of("node:root/1"), None);
        assert_eq!(color_of("D"), Some(Color32::BLUE));
        assert_eq!(color_of("node:root"), None);
    }

    #[test]
    fn ungrouped_leaf_breaks_uniformity() {
        let assembly = assembly();
        let groups: HashMap<String, Color32> = [("A".to_string(), Color32::RED)].into();
        let colors = subtree_colors(&assembly, &groups);
        assert_eq!(colors[assembly.index_of("node:root/0").unwrap()], None);
    }

    #[test]
    fn highlight_marks_paths_to_highlighted_leaves() {
        let assembly = assembly();
        let set: HashSet<String> = ["C".to_string()].into();
        let flags = highlighted_nodes(&assembly, &set);
        let flag = |id: &str| flags[assembly.index_of(id).unwrap()];
        assert!(flag("C") && flag("node:root/1") && flag("node:root"));
        assert!(!flag("D") && !flag("node:root/0") && !flag("A"));
    }

    #[test]
    fn branch_labels_are_rounded_decimals() {
        let painter = TreePainter::default();
        assert_eq!(painter.branch_label_text(Decimal::new(123_456, 5)), "1.2346");
        assert_eq!(painter.branch_label_text(Decimal::new(2, 0)), "2");
    }
}
