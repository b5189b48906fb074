use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::debug;

use super::channel::{LinkedValue, Origin, Originated, Subscription};
use super::schedule::Debouncer;

/// Vertical scroll position in CSS pixels, tagged with the surface that wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollPosition {
    pub position: f32,
    pub origin: Origin,
}

impl Originated for ScrollPosition {
    fn origin(&self) -> &Origin {
        &self.origin
    }
}

pub type ScrollLink = LinkedValue<ScrollPosition>;

/// Sort field of the line list; `None` keeps dendrogram order.
pub type ListSort = LinkedValue<Option<String>>;

/// The two channels the tree and the line list share.
#[derive(Clone)]
pub struct LinkChannels {
    pub scroll: ScrollLink,
    pub sort: ListSort,
}

impl Default for LinkChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkChannels {
    pub fn new() -> Self {
        Self {
            scroll: LinkedValue::new(ScrollPosition {
                position: 0.0,
                origin: Origin::new("none"),
            }),
            sort: LinkedValue::new(None),
        }
    }
}

/// Tree-side half of the scroll link.
///
/// Holds the linked flag and the debounced outgoing position; incoming
/// positions are applied by the owner of the viewport.
pub struct ViewSync {
    channels: LinkChannels,
    origin: Origin,
    linked: Cell<bool>,
    outgoing: RefCell<Debouncer<f32>>,
}

impl ViewSync {
    pub fn new(channels: LinkChannels, origin: Origin, debounce: Duration) -> Self {
        let linked = channels.sort.get().is_none();
        Self {
            channels,
            origin,
            linked: Cell::new(linked),
            outgoing: RefCell::new(Debouncer::new(debounce)),
        }
    }

    pub fn channels(&self) -> &LinkChannels {
        &self.channels
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn is_linked(&self) -> bool {
        self.linked.get()
    }

    /// Returns whether the link was up before the call.
    pub fn unlink(&self) -> bool {
        let was = self.linked.replace(false);
        if self.outgoing.borrow_mut().cancel() {
            debug!("dropped pending scroll publication on unlink");
        }
        was
    }

    /// Clear the list sort and mark the link as up. Zoom reset and
    /// repositioning are the caller's part of the transition.
    pub fn relink(&self) {
        if self.channels.sort.get().is_some() {
            self.channels.sort.set(None);
        }
        self.linked.set(true);
    }

    /// Queue a tree → list publication; repeated calls inside the window
    /// coalesce into the last position.
    pub fn queue(&self, now: Instant, position_css: f32) {
        if self.is_linked() {
            self.outgoing.borrow_mut().schedule(now, position_css);
        }
    }

    pub fn publish_now(&self, position_css: f32) {
        self.outgoing.borrow_mut().cancel();
        self.channels.scroll.publish(ScrollPosition {
            position: position_css,
            origin: self.origin.clone(),
        });
    }

    /// Publish the queued position once its debounce deadline has passed.
    pub fn poll(&self, now: Instant) -> bool {
        let due = self.outgoing.borrow_mut().poll(now);
        match due {
            Some(position) if self.is_linked() => {
                self.publish_now(position);
                true
            }
            _ => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.outgoing.borrow().is_pending()
    }

    pub fn cancel(&self) {
        self.outgoing.borrow_mut().cancel();
    }
}

/// List-side half of the scroll link, used by the line list host.
pub struct ListLink {
    channels: LinkChannels,
    incoming: Rc<Cell<Option<f32>>>,
    _scroll: Subscription,
}

impl ListLink {
    pub fn new(channels: LinkChannels) -> Self {
        let incoming = Rc::new(Cell::new(None));
        let sink = Rc::clone(&incoming);
        let scroll = channels
            .scroll
            .subscribe_as(Origin::LIST, move |update: &ScrollPosition| {
                sink.set(Some(update.position))
            });
        Self {
            channels,
            incoming,
            _scroll: scroll,
        }
    }

    /// Latest position the tree published since the last call.
    pub fn take_incoming(&self) -> Option<f32> {
        self.incoming.take()
    }

    pub fn publish_scroll(&self, position_css: f32) {
        self.channels.scroll.publish(ScrollPosition {
            position: position_css,
            origin: Origin::LIST,
        });
    }

    pub fn sort(&self) -> Option<String> {
        self.channels.sort.get()
    }

    pub fn set_sort(&self, field: Option<String>) {
        self.channels.sort.set(field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_publications_reach_list_after_debounce() {
        let channels = LinkChannels::new();
        let list = ListLink::new(channels.clone());
        let sync = ViewSync::new(channels, Origin::TREE, Duration::from_millis(50));
        let start = Instant::now();

        sync.queue(start, 10.0);
        sync.queue(start + Duration::from_millis(20), 40.0);
        assert!(!sync.poll(start + Duration::from_millis(60)));
        assert_eq!(list.take_incoming(), None);

        assert!(sync.poll(start + Duration::from_millis(75)));
        assert_eq!(list.take_incoming(), Some(40.0));
        assert_eq!(list.take_incoming(), None);
    }

    #[test]
    fn list_never_hears_its_own_scroll() {
        let channels = LinkChannels::new();
        let list = ListLink::new(channels.clone());
        list.publish_scroll(120.0);
        assert_eq!(list.take_incoming(), None);
        assert_eq!(channels.scroll.get().position, 120.0);
    }

    #[test]
    fn relink_clears_sort_and_unlink_drops_pending() {
        let channels = LinkChannels::new();
        let list = ListLink::new(channels.clone());
        list.set_sort(Some("onset".into()));
        let sync = ViewSync::new(channels, Origin::TREE, Duration::from_millis(50));
        assert!(!sync.is_linked());

        sync.relink();
        assert!(sync.is_linked());
        assert_eq!(list.sort(), None);

        let start = Instant::now();
        sync.queue(start, 5.0);
        assert!(sync.unlink());
        assert!(!sync.poll(start + Duration::from_secs(1)));
        assert_eq!(list.take_incoming(), None);
    }
}
