use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Identity of a publishing view, used to drop a view's own writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin(Cow<'static, str>);

impl Origin {
    pub const TREE: Origin = Origin(Cow::Borrowed("tree"));
    pub const LIST: Origin = Origin(Cow::Borrowed("list"));
    pub const MAP: Origin = Origin(Cow::Borrowed("map"));
    pub const LEGEND: Origin = Origin(Cow::Borrowed("legend"));

    pub fn new(name: impl Into<String>) -> Self {
        Origin(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Values that remember which view published them.
pub trait Originated {
    fn origin(&self) -> &Origin;
}

type Callback<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct Subscriber<T> {
    id: u64,
    exclude: Option<Origin>,
    callback: Callback<T>,
}

struct Inner<T> {
    value: T,
    next_id: u64,
    subscribers: Vec<Subscriber<T>>,
}

/// Current value plus subscriber list; publishing replaces the value wholesale
/// and delivers it synchronously.
pub struct LinkedValue<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for LinkedValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> LinkedValue<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                value: initial,
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn get(&self) -> T {
        self.inner.borrow().value.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    /// Receive every publication.
    pub fn subscribe(&self, callback: impl FnMut(&T) + 'static) -> Subscription {
        self.register(None, callback)
    }

    fn register(&self, exclude: Option<Origin>, callback: impl FnMut(&T) + 'static) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        let callback: Callback<T> = Rc::new(RefCell::new(callback));
        inner.subscribers.push(Subscriber {
            id,
            exclude,
            callback,
        });

        let weak: Weak<RefCell<Inner<T>>> = Rc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.borrow_mut().subscribers.retain(|s| s.id != id);
                }
            })),
        }
    }

    fn deliver(&self, value: T, origin: Option<&Origin>) {
        let targets: Vec<Callback<T>> = {
            let mut inner = self.inner.borrow_mut();
            inner.value = value.clone();
            inner
                .subscribers
                .iter()
                .filter(|s| match (&s.exclude, origin) {
                    (Some(own), Some(origin)) => own != origin,
                    _ => true,
                })
                .map(|s| Rc::clone(&s.callback))
                .collect()
        };
        for callback in targets {
            // A subscriber that is already running (re-entrant publish) is skipped.
            if let Ok(mut callback) = callback.try_borrow_mut() {
                (callback)(&value);
            }
        }
    }
}

impl<T: Clone + Originated + 'static> LinkedValue<T> {
    /// Receive every publication except those whose origin is `own`.
    pub fn subscribe_as(
        &self,
        own: Origin,
        callback: impl FnMut(&T) + 'static,
    ) -> Subscription {
        self.register(Some(own), callback)
    }

    pub fn publish(&self, value: T) {
        let origin = value.origin().clone();
        self.deliver(value, Some(&origin));
    }
}

impl<T: Clone + 'static> LinkedValue<T> {
    /// Replace the value without origin filtering.
    pub fn set(&self, value: T) {
        self.deliver(value, None);
    }
}

/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
