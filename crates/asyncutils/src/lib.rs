//! Small async building blocks shared by the melo crates.
//!
//! - [`paginate`] drains a cursor-following paged API into a flat
//!   [`Stream`](futures::Stream), one page at a time.
//! - [`Broadcast`] is a last-value cell with an explicit subscriber list:
//!   every new [`Subscription`] first receives the current value, then
//!   every later value in publication order.

mod broadcast;
mod paginate;

pub use crate::broadcast::{Broadcast, Subscription, WeakBroadcast};
pub use crate::paginate::{Page, paginate};
