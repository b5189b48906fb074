use log::debug;

use super::{DendrogramIndex, NodeId};
use crate::error::{FilterError, Unavailable};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FilterState {
    #[default]
    Unfiltered,
    Filtered { root_id: NodeId },
}

impl FilterState {
    pub fn root_id(&self) -> Option<&str> {
        match self {
            FilterState::Unfiltered => None,
            FilterState::Filtered { root_id } => Some(root_id),
        }
    }

    pub fn is_filtered(&self) -> bool {
        matches!(self, FilterState::Filtered { .. })
    }
}

/// Step-in / step-out narrowing of the visible leaf set.
///
/// Every transition is resolved against the index of the unfiltered tree.
/// While filtered, a further step-in must name a node inside the current view.
#[derive(Debug, Clone, Default)]
pub struct SubtreeFilter {
    state: FilterState,
}

impl SubtreeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn step_in(
        &mut self,
        index: &DendrogramIndex,
        node_id: &str,
    ) -> Result<&FilterState, FilterError> {
        if index.is_empty() {
            return Err(FilterError::NoTree);
        }
        let entry = index
            .get(node_id)
            .ok_or_else(|| FilterError::UnknownNode(node_id.to_string()))?;
        if entry.child_count == 0 || entry.leaf_names.len() < 2 {
            return Err(FilterError::NotASubtree(node_id.to_string()));
        }
        if let Some(root_id) = self.state.root_id() {
            if !index.is_within(node_id, root_id) {
                return Err(FilterError::OutsideView(node_id.to_string()));
            }
        }

        self.state = if index.is_root(node_id) {
            FilterState::Unfiltered
        } else {
            FilterState::Filtered {
                root_id: node_id.to_string(),
            }
        };
        debug!("subtree filter stepped in to {:?}", self.state);
        Ok(&self.state)
    }

    pub fn step_out(&mut self, index: &DendrogramIndex) -> Result<&FilterState, FilterError> {
        let FilterState::Filtered { root_id } = &self.state else {
            return Err(FilterError::NotFiltered);
        };
        if !index.contains(root_id) {
            return Err(FilterError::UnknownNode(root_id.clone()));
        }
        self.state = match index.branching_ancestor(root_id) {
            Some(ancestor) if !index.is_root(ancestor) => FilterState::Filtered {
                root_id: ancestor.to_string(),
            },
            _ => FilterState::Unfiltered,
        };
        debug!("subtree filter stepped out to {:?}", self.state);
        Ok(&self.state)
    }

    pub fn clear(&mut self) -> Result<&FilterState, FilterError> {
        if !self.state.is_filtered() {
            return Err(FilterError::NotFiltered);
        }
        self.state = FilterState::Unfiltered;
        debug!("subtree filter cleared");
        Ok(&self.state)
    }

    /// Leaf names of the active dataset; `None` when unfiltered.
    pub fn active_leaf_names(&self, index: &DendrogramIndex) -> Option<Vec<String>> {
        let root_id = self.state.root_id()?;
        index.get(root_id).map(|entry| entry.leaf_names.clone())
    }

    /// Check the filter root still exists after the unfiltered tree changed.
    pub fn revalidate(&self, index: &DendrogramIndex) -> Result<(), Unavailable> {
        match self.state.root_id() {
            Some(root_id) if !index.contains(root_id) => Err(Unavailable::FilterMismatch),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{sample_tree, DendrogramNode, ROOT_ID};
    use rust_decimal::Decimal;

    fn index() -> DendrogramIndex {
        DendrogramIndex::build(&sample_tree())
    }

    #[test]
    fn step_in_then_out_restores_full_tree() {
        let index = index();
        let mut filter = SubtreeFilter::new();
        filter.step_in(&index, "node:root/0").unwrap();
        assert_eq!(
            filter.active_leaf_names(&index),
            Some(vec!["A".to_string(), "B".to_string()])
        );
        assert_eq!(filter.step_out(&index).unwrap(), &FilterState::Unfiltered);
        assert_eq!(filter.active_leaf_names(&index), None);
    }

    #[test]
    fn leaves_and_unknown_ids_are_rejected() {
        let index = index();
        let mut filter = SubtreeFilter::new();
        assert_eq!(
            filter.step_in(&index, "A"),
            Err(FilterError::NotASubtree("A".to_string()))
        );
        assert_eq!(
            filter.step_in(&index, "node:root/7"),
            Err(FilterError::UnknownNode("node:root/7".to_string()))
        );
        assert_eq!(filter.state(), &FilterState::Unfiltered);
        assert_eq!(filter.step_out(&index), Err(FilterError::NotFiltered));
        assert_eq!(filter.clear(), Err(FilterError::NotFiltered));
    }

    #[test]
    fn stepping_into_the_root_is_unfiltered() {
        let index = index();
        let mut filter = SubtreeFilter::new();
        assert_eq!(filter.step_in(&index, ROOT_ID).unwrap(), &FilterState::Unfiltered);
    }

    // (((A,B),(C,D)),E): stepping out of (A,B) lands on ((A,B),(C,D)).
    fn deep_tree() -> DendrogramNode {
        let d = Decimal::ONE;
        DendrogramNode::internal(
            Decimal::ZERO,
            vec![
                DendrogramNode::internal(
                    d,
                    vec![
                        DendrogramNode::internal(
                            d,
                            vec![DendrogramNode::leaf("A", d), DendrogramNode::leaf("B", d)],
                        ),
                        DendrogramNode::internal(
                            d,
                            vec![DendrogramNode::leaf("C", d), DendrogramNode::leaf("D", d)],
                        ),
                    ],
                ),
                DendrogramNode::leaf("E", d),
            ],
        )
    }

    #[test]
    fn step_out_moves_to_nearest_ancestor_not_root() {
        let index = DendrogramIndex::build(&deep_tree());
        let mut filter = SubtreeFilter::new();
        filter.step_in(&index, "node:root/0").unwrap();
        filter.step_in(&index, "node:root/0/0").unwrap();
        assert_eq!(
            filter.step_out(&index).unwrap(),
            &FilterState::Filtered {
                root_id: "node:root/0".to_string()
            }
        );
        assert_eq!(filter.step_out(&index).unwrap(), &FilterState::Unfiltered);
    }

    #[test]
    fn step_in_keeps_the_requested_root_and_step_out_skips_unary_ancestors() {
        // ((((A,B)),C)): node:root/0 is unary above (A,B).
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
        let mut filter = SubtreeFilter::new();

        assert_eq!(
            filter.step_in(&index, "node:root/0").unwrap(),
            &FilterState::Filtered {
                root_id: "node:root/0".to_string()
            }
        );
        assert_eq!(
            filter.active_leaf_names(&index),
            Some(vec!["A".to_string(), "B".to_string()])
        );
        filter.step_in(&index, "node:root/0/0").unwrap();
        assert_eq!(filter.step_out(&index).unwrap(), &FilterState::Unfiltered);
    }

    #[test]
    fn step_in_outside_the_current_view_is_rejected() {
        let index = DendrogramIndex::build(&deep_tree());
        let mut filter = SubtreeFilter::new();
        filter.step_in(&index, "node:root/0/0").unwrap();
        assert_eq!(
            filter.step_in(&index, "node:root/0/1"),
            Err(FilterError::OutsideView("node:root/0/1".to_string()))
        );
        assert_eq!(
            filter.state(),
            &FilterState::Filtered {
                root_id: "node:root/0/0".to_string()
            }
        );
        filter.step_in(&index, "node:root/0/0").unwrap();
    }

    #[test]
    fn reload_without_the_filter_root_is_a_mismatch() {
        let mut filter = SubtreeFilter::new();
        filter.step_in(&DendrogramIndex::build(&deep_tree()), "node:root/0/1").unwrap();
        assert_eq!(filter.revalidate(&index()), Err(Unavailable::FilterMismatch));
        assert!(filter.clear().is_ok());
        assert_eq!(filter.revalidate(&index()), Ok(()));
    }
}
