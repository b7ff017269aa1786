//! Slotted timing wheel for deferred and repeating callbacks.
//!
//! A `Wheel` spreads tasks over a fixed ring of 3600 buckets and advances a
//! cursor one bucket per tick, firing whatever is due under it; delays longer
//! than one full rotation are carried as a lap counter. Insertion and
//! cancellation are O(1), at the cost of one-tick resolution. `Carousel`
//! wraps a wheel in a dedicated control-loop thread fed by a periodic clock,
//! running every fired job on its own fire-and-forget thread.
//!
//! ## Carousel Example:
//!
//! ```rust
//! use std::time::Duration;
//!
//! use crossbeam_channel::unbounded;
//! use carousel::CarouselBuilder;
//!
//! let (fired, observed) = unbounded();
//!
//! // Every task without its own job reports through this one
//! let carousel = CarouselBuilder::new(move |args: &[u32]| {
//!     for &arg in args {
//!         let _ = fired.send(arg);
//!     }
//! })
//! // Tick interval defines the resolution for the wheel (all delays
//! // are rounded up to a multiple of this)
//! .with_tick_interval(Duration::from_millis(10))
//! .build();
//!
//! // Fires on the first tick; the key would let us cancel it
//! let key = carousel.add(Duration::from_millis(10), vec![5]);
//! assert_eq!(Ok(5), observed.recv_timeout(Duration::from_secs(2)));
//!
//! // The task already fired, so cancelling its key is a silent no-op
//! carousel.cancel(key);
//!
//! // Stop the clock; the driver is gone for good afterwards
//! carousel.exit();
//! ```

mod carousel;
mod wheel;

pub use crate::carousel::{Carousel, CarouselBuilder};
pub use crate::wheel::{Firing, Job, Key, Repeat, Wheel, WheelBuilder, SLOT_COUNT};
