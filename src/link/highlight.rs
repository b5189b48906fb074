use super::channel::{LinkedValue, Origin, Originated, Subscription};

/// The currently highlighted case set and the zone that published it.
#[derive(Debug, Clone, PartialEq)]
pub struct Highlight {
    pub case_ids: Vec<String>,
    pub origin: Origin,
}

impl Highlight {
    pub fn none(origin: Origin) -> Self {
        Self {
            case_ids: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.case_ids.is_empty()
    }
}

impl Originated for Highlight {
    fn origin(&self) -> &Origin {
        &self.origin
    }
}

/// Dashboard-wide highlight service. Constructed once by the host and passed
/// to every zone (map, list, tree, legend) that publishes or listens.
#[derive(Clone)]
pub struct Highlighter {
    channel: LinkedValue<Highlight>,
}

impl Default for Highlighter {
    fn default() -> Self {
        Self::new()
    }
}

impl Highlighter {
    pub fn new() -> Self {
        Self {
            channel: LinkedValue::new(Highlight::none(Origin::new("none"))),
        }
    }

    pub fn current(&self) -> Highlight {
        self.channel.get()
    }

    pub fn publish(&self, case_ids: Vec<String>, origin: Origin) {
        self.channel.publish(Highlight { case_ids, origin });
    }

    pub fn clear(&self, origin: Origin) {
        self.channel.publish(Highlight::none(origin));
    }

    /// Listen as `zone`; publications from `zone` itself are never delivered.
    pub fn subscribe(
        &self,
        zone: Origin,
        callback: impl FnMut(&Highlight) + 'static,
    ) -> Subscription {
        self.channel.subscribe_as(zone, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn map_highlight_reaches_tree_but_not_map() {
        let highlighter = Highlighter::new();
        let tree_seen = Rc::new(RefCell::new(Vec::new()));
        let map_seen = Rc::new(RefCell::new(Vec::new()));

        let t = Rc::clone(&tree_seen);
        let _tree = highlighter.subscribe(Origin::TREE, move |h| {
            t.borrow_mut().push(h.case_ids.clone())
        });
        let m = Rc::clone(&map_seen);
        let _map = highlighter.subscribe(Origin::MAP, move |h| {
            m.borrow_mut().push(h.case_ids.clone())
        });

        highlighter.publish(vec!["A".into(), "C".into()], Origin::MAP);

        assert_eq!(*tree_seen.borrow(), vec![vec!["A".to_string(), "C".to_string()]]);
        assert!(map_seen.borrow().is_empty());
        assert_eq!(highlighter.current().origin, Origin::MAP);
    }
}
