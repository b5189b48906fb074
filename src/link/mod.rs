//! Cross-view plumbing: observable values, the highlight service, redraw
//! coalescing and the tree/list scroll link.

pub mod channel;
pub mod highlight;
pub mod schedule;
pub mod sync;

pub use channel::{LinkedValue, Origin, Originated, Subscription};
pub use highlight::{Highlight, Highlighter};
pub use schedule::{Debouncer, FrameScheduler};
pub use sync::{LinkChannels, ListLink, ListSort, ScrollLink, ScrollPosition, ViewSync};
