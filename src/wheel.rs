use std::cmp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slab::Slab;

/// Number of buckets in a wheel; one full rotation spans
/// `SLOT_COUNT * tick_interval`.
pub const SLOT_COUNT: usize = 3600;

const DEFAULT_TICK_MILLIS: u64 = 1000;

/// Callback invoked when a task fires, receiving the task's argument list.
pub type Job<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

/// Builder for configuring different options for a `Wheel`.
pub struct WheelBuilder<T> {
    tick_interval: Duration,
    default_job: Job<T>,
}

impl<T> WheelBuilder<T> {
    /// Create a builder with the given default job, used for every task that
    /// does not carry its own.
    pub fn new<F>(default_job: F) -> WheelBuilder<T>
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        WheelBuilder {
            tick_interval: Duration::from_millis(DEFAULT_TICK_MILLIS),
            default_job: Arc::new(default_job),
        }
    }

    /// Sets the tick interval which sets the resolution for the wheel.
    ///
    /// Any delays will be rounded up based on the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> WheelBuilder<T> {
        self.tick_interval = interval;
        self
    }

    /// Get the tick interval that was set.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Build a new `Wheel` from the current builder.
    pub fn build(self) -> Wheel<T> {
        self.into()
    }
}

//--------------------------------------------------------------//

/// Identity of a logical scheduled task, stable across all of its repeat
/// firings; used for cancellation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key(pub(crate) u64);

/// Remaining fire count for a scheduled task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Repeat {
    /// Fire the given number of times. `Times(0)` is already exhausted and
    /// never fires.
    Times(u32),
    /// Fire indefinitely until cancelled.
    Forever,
}

impl Repeat {
    /// Map a signed fire count to a `Repeat`.
    ///
    /// `-1` means forever and any count below `1` (other than `-1`) is
    /// treated as already exhausted.
    pub fn from_count(count: i32) -> Repeat {
        match count {
            -1 => Repeat::Forever,
            count if count >= 1 => Repeat::Times(count as u32),
            _ => Repeat::Times(0),
        }
    }

    fn after_fire(self) -> Option<Repeat> {
        match self {
            Repeat::Forever => Some(Repeat::Forever),
            Repeat::Times(count) if count > 1 => Some(Repeat::Times(count - 1)),
            Repeat::Times(_) => None,
        }
    }
}

struct Entry<T> {
    key: Key,
    // Clamped at submission; continuations reuse it verbatim
    delay_millis: u64,
    laps: u64,
    repeat: Repeat,
    job: Option<Job<T>>,
    args: Arc<Vec<T>>,
    slot: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// One due task, detached from the wheel and ready to run.
pub struct Firing<T> {
    key: Key,
    job: Job<T>,
    args: Arc<Vec<T>>,
}

impl<T> Firing<T> {
    /// Key of the task that fired.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Arguments the task was submitted with.
    pub fn args(&self) -> &[T] {
        &self.args
    }

    /// Invoke the task's effective job with its arguments.
    pub fn invoke(self) {
        (self.job)(self.args.as_slice())
    }
}

/// `Wheel` which stores deferred and repeating tasks in `SLOT_COUNT` buckets
/// under a rotating cursor.
///
/// The wheel is a plain data structure: it only moves when `tick` is called,
/// which makes it fully deterministic. `Carousel` wraps one in a dedicated
/// thread driven by a periodic clock.
pub struct Wheel<T> {
    // Head entry of each bucket's intrusive list, indexing into storage
    slots: Vec<Option<usize>>,
    storage: Slab<Entry<T>>,
    // key -> storage index, for O(1) cancellation
    timers: HashMap<Key, usize>,
    cursor: usize,
    tick_millis: u64,
    next_key: Arc<AtomicU64>,
    default_job: Job<T>,
}

impl<T> From<WheelBuilder<T>> for Wheel<T> {
    fn from(builder: WheelBuilder<T>) -> Wheel<T> {
        // Sub-millisecond intervals would truncate to zero and break
        // placement, clamp them up
        let tick_millis = cmp::max(1, builder.tick_interval.as_millis() as u64);

        Wheel {
            slots: vec![None; SLOT_COUNT],
            storage: Slab::new(),
            timers: HashMap::new(),
            cursor: 0,
            tick_millis,
            next_key: Arc::new(AtomicU64::new(0)),
            default_job: builder.default_job,
        }
    }
}

impl<T> Wheel<T> {
    /// Schedule a task that fires once after the given delay, invoking the
    /// wheel's default job.
    ///
    /// Delays shorter than the tick interval are silently raised to one tick.
    pub fn schedule(&mut self, delay: Duration, args: Vec<T>) -> Key {
        self.schedule_repeat(Repeat::Times(1), delay, args)
    }

    /// Schedule a task that fires repeatedly at the given delay.
    pub fn schedule_repeat(&mut self, repeat: Repeat, delay: Duration, args: Vec<T>) -> Key {
        let key = self.allot();
        self.insert(key, repeat, delay, None, Arc::new(args));
        key
    }

    /// Schedule a single-fire task carrying its own job instead of the
    /// wheel's default.
    pub fn schedule_with<F>(&mut self, delay: Duration, job: F, args: Vec<T>) -> Key
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        self.schedule_repeat_with(Repeat::Times(1), delay, job, args)
    }

    /// Schedule a repeating task carrying its own job.
    pub fn schedule_repeat_with<F>(
        &mut self,
        repeat: Repeat,
        delay: Duration,
        job: F,
        args: Vec<T>,
    ) -> Key
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        let key = self.allot();
        self.insert(key, repeat, delay, Some(Arc::new(job)), Arc::new(args));
        key
    }

    /// Remove the task with the given key, if it is currently scheduled.
    ///
    /// Unknown keys (never issued, already fired, already cancelled) are a
    /// silent no-op. Cancelling a repeating task also suppresses all of its
    /// future repeats.
    pub fn cancel(&mut self, key: Key) -> bool {
        match self.timers.remove(&key) {
            Some(index) => {
                self.unlink(index);
                true
            }
            None => false,
        }
    }

    /// Advance the cursor by one bucket and drain everything due under it.
    ///
    /// Tasks still owing full rotations have their lap count decremented in
    /// place. Due tasks are removed and returned; repeat continuations are
    /// re-placed before this call returns, under the same key, so a
    /// subsequent `cancel` always covers the whole logical task.
    pub fn tick(&mut self) -> Vec<Firing<T>> {
        self.cursor = (self.cursor + 1) % SLOT_COUNT;

        let mut fired = Vec::new();
        let mut walk = self.slots[self.cursor];

        while let Some(index) = walk {
            walk = self.storage[index].next;

            if self.storage[index].laps > 0 {
                self.storage[index].laps -= 1;
                continue;
            }

            let entry = self.unlink(index);
            self.timers.remove(&entry.key);

            let job = entry
                .job
                .clone()
                .unwrap_or_else(|| self.default_job.clone());
            fired.push(Firing { key: entry.key, job, args: entry.args.clone() });

            if let Some(repeat) = entry.repeat.after_fire() {
                // Re-placement lands at least one tick ahead, never back in
                // the stretch of this bucket we are still walking
                self.place(entry.key, repeat, entry.delay_millis, entry.job, entry.args);
            }
        }

        fired
    }

    /// Number of currently scheduled tasks.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether no tasks are currently scheduled.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Tick interval this wheel was built with.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// Counter that issues this wheel's task keys; shared with any driver
    /// handing out keys on the wheel's behalf.
    pub(crate) fn key_counter(&self) -> Arc<AtomicU64> {
        self.next_key.clone()
    }

    pub(crate) fn insert(
        &mut self,
        key: Key,
        repeat: Repeat,
        delay: Duration,
        job: Option<Job<T>>,
        args: Arc<Vec<T>>,
    ) {
        // Delays below one tick are raised, not rejected
        let delay_millis = cmp::max(delay.as_millis() as u64, self.tick_millis);
        self.place(key, repeat, delay_millis, job, args);
    }

    fn allot(&mut self) -> Key {
        Key(self.next_key.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn place(
        &mut self,
        key: Key,
        repeat: Repeat,
        delay_millis: u64,
        job: Option<Job<T>>,
        args: Arc<Vec<T>>,
    ) {
        if repeat == Repeat::Times(0) {
            return;
        }

        let ticks_ahead = delay_millis / self.tick_millis;
        let laps = ticks_ahead / SLOT_COUNT as u64;
        let slot = ((self.cursor as u64 + ticks_ahead) % SLOT_COUNT as u64) as usize;

        let head = self.slots[slot];
        let index = self.storage.insert(Entry {
            key,
            delay_millis,
            laps,
            repeat,
            job,
            args,
            slot,
            prev: None,
            next: head,
        });

        if let Some(head) = head {
            self.storage[head].prev = Some(index);
        }
        self.slots[slot] = Some(index);
        self.timers.insert(key, index);
    }

    /// Detach the entry at `index` from its bucket's list and release its
    /// storage.
    fn unlink(&mut self, index: usize) -> Entry<T> {
        let entry = self.storage.remove(index);

        match (entry.prev, entry.next) {
            (Some(prev), Some(next)) => {
                // In the middle of a list, update prev and next
                self.storage[prev].next = Some(next);
                self.storage[next].prev = Some(prev);
            }
            (None, Some(next)) => {
                // At the front of a list with another element, update the
                // bucket head and next
                self.storage[next].prev = None;
                self.slots[entry.slot] = Some(next);
            }
            (Some(prev), None) => {
                // At the end of a list, update prev
                self.storage[prev].next = None;
            }
            (None, None) => {
                // Sole element, empty the bucket head
                self.slots[entry.slot] = None;
            }
        }

        entry
    }
}

#[cfg(test)]
mod tests {
    use super::{Firing, Key, Repeat, Wheel, WheelBuilder};

    use std::time::Duration;

    use crossbeam_channel::{unbounded, Receiver};

    fn counting_wheel(tick_millis: u64) -> (Wheel<u32>, Receiver<u32>) {
        let (send, recv) = unbounded();
        let wheel = WheelBuilder::new(move |args: &[u32]| {
            for &arg in args {
                send.send(arg).unwrap();
            }
        })
        .with_tick_interval(Duration::from_millis(tick_millis))
        .build();

        (wheel, recv)
    }

    fn fired_keys(wheel: &mut Wheel<u32>) -> Vec<Key> {
        wheel.tick().iter().map(Firing::key).collect()
    }

    #[test]
    fn positive_sub_interval_delay_fires_on_first_tick() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let key = wheel.schedule(Duration::from_millis(1), vec![]);
        assert_eq!(vec![key], fired_keys(&mut wheel));
        assert!(wheel.is_empty());
    }

    #[test]
    fn positive_delay_equal_to_interval_fires_on_first_tick() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let key = wheel.schedule(Duration::from_millis(1000), vec![]);
        assert_eq!(vec![key], fired_keys(&mut wheel));
    }

    #[test]
    fn positive_repeat_fires_exactly_n_times() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let key = wheel.schedule_repeat(Repeat::Times(3), Duration::from_millis(1000), vec![]);
        for _ in 0..3 {
            assert_eq!(vec![key], fired_keys(&mut wheel));
        }
        for _ in 0..10 {
            assert!(fired_keys(&mut wheel).is_empty());
        }
        assert!(wheel.is_empty());
    }

    #[test]
    fn positive_forever_repeats_until_cancelled() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let key = wheel.schedule_repeat(Repeat::Forever, Duration::from_millis(1000), vec![]);
        for _ in 0..5 {
            assert_eq!(vec![key], fired_keys(&mut wheel));
        }

        assert!(wheel.cancel(key));
        for _ in 0..5 {
            assert!(fired_keys(&mut wheel).is_empty());
        }
        assert!(wheel.is_empty());
    }

    #[test]
    fn positive_cancel_before_due_suppresses_fire() {
        let (mut wheel, recv) = counting_wheel(1000);

        let key = wheel.schedule(Duration::from_millis(2000), vec![7]);
        assert!(wheel.cancel(key));
        assert_eq!(0, wheel.len());

        for _ in 0..4 {
            assert!(fired_keys(&mut wheel).is_empty());
        }
        assert!(recv.try_recv().is_err());
    }

    #[test]
    fn positive_cancel_unknown_key_is_noop() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let key = wheel.schedule(Duration::from_millis(1000), vec![]);
        assert!(!wheel.cancel(Key(9999)));

        // The scheduled task is untouched
        assert_eq!(vec![key], fired_keys(&mut wheel));
    }

    #[test]
    fn positive_cancel_after_fire_is_noop() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let key = wheel.schedule(Duration::from_millis(1000), vec![]);
        assert_eq!(vec![key], fired_keys(&mut wheel));
        assert!(!wheel.cancel(key));
    }

    #[test]
    fn positive_long_delay_waits_out_full_rotation() {
        let (mut wheel, _recv) = counting_wheel(1000);

        // 3601 ticks ahead: bucket 1 with one lap still owed
        let key = wheel.schedule(Duration::from_millis(3_601_000), vec![]);
        for _ in 0..3600 {
            assert!(fired_keys(&mut wheel).is_empty());
        }
        assert_eq!(vec![key], fired_keys(&mut wheel));
    }

    #[test]
    fn positive_exact_rotation_delay_takes_two_passes() {
        let (mut wheel, _recv) = counting_wheel(1000);

        // 3600 ticks ahead lands back on the cursor's own bucket with one
        // lap owed, so the fire waits for a second full pass
        let key = wheel.schedule(Duration::from_millis(3_600_000), vec![]);
        for _ in 0..7199 {
            assert!(fired_keys(&mut wheel).is_empty());
        }
        assert_eq!(vec![key], fired_keys(&mut wheel));
    }

    #[test]
    fn positive_cancel_covers_future_continuations() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let key = wheel.schedule_repeat(Repeat::Times(3), Duration::from_millis(1000), vec![]);
        assert_eq!(vec![key], fired_keys(&mut wheel));

        // The continuation is already re-placed under the same key
        assert!(wheel.cancel(key));
        for _ in 0..5 {
            assert!(fired_keys(&mut wheel).is_empty());
        }
    }

    #[test]
    fn positive_exhausted_counts_never_schedule() {
        let (mut wheel, _recv) = counting_wheel(1000);

        wheel.schedule_repeat(Repeat::from_count(0), Duration::from_millis(1000), vec![]);
        wheel.schedule_repeat(Repeat::from_count(-2), Duration::from_millis(1000), vec![]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn positive_repeat_from_count_mapping() {
        assert_eq!(Repeat::Forever, Repeat::from_count(-1));
        assert_eq!(Repeat::Times(1), Repeat::from_count(1));
        assert_eq!(Repeat::Times(3), Repeat::from_count(3));
        assert_eq!(Repeat::Times(0), Repeat::from_count(0));
        assert_eq!(Repeat::Times(0), Repeat::from_count(-5));
    }

    #[test]
    fn positive_keys_are_unique_and_monotonic() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let first = wheel.schedule(Duration::from_millis(1000), vec![]);
        let second = wheel.schedule(Duration::from_millis(1000), vec![]);
        assert_ne!(first, second);
        assert!(second.0 > first.0);
    }

    #[test]
    fn positive_args_delivered_in_order() {
        let (mut wheel, recv) = counting_wheel(1000);

        wheel.schedule(Duration::from_millis(1000), vec![1, 2, 3]);
        for firing in wheel.tick() {
            firing.invoke();
        }

        assert_eq!(Ok(1), recv.try_recv());
        assert_eq!(Ok(2), recv.try_recv());
        assert_eq!(Ok(3), recv.try_recv());
        assert!(recv.try_recv().is_err());
    }

    #[test]
    fn positive_task_job_overrides_default() {
        let (mut wheel, default_recv) = counting_wheel(1000);
        let (send, recv) = unbounded();

        wheel.schedule_with(
            Duration::from_millis(1000),
            move |args: &[u32]| {
                for &arg in args {
                    send.send(arg + 100).unwrap();
                }
            },
            vec![5],
        );
        for firing in wheel.tick() {
            firing.invoke();
        }

        assert_eq!(Ok(105), recv.try_recv());
        assert!(default_recv.try_recv().is_err());
    }

    #[test]
    fn positive_same_bucket_tasks_all_fire() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let first = wheel.schedule(Duration::from_millis(1000), vec![]);
        let second = wheel.schedule(Duration::from_millis(1000), vec![]);
        let third = wheel.schedule(Duration::from_millis(1000), vec![]);

        let mut fired = fired_keys(&mut wheel);
        fired.sort_by_key(|key| key.0);
        assert_eq!(vec![first, second, third], fired);
        assert!(wheel.is_empty());
    }

    #[test]
    fn positive_cancel_middle_of_bucket_keeps_neighbors() {
        let (mut wheel, _recv) = counting_wheel(1000);

        let first = wheel.schedule(Duration::from_millis(1000), vec![]);
        let second = wheel.schedule(Duration::from_millis(1000), vec![]);
        let third = wheel.schedule(Duration::from_millis(1000), vec![]);

        assert!(wheel.cancel(second));

        let mut fired = fired_keys(&mut wheel);
        fired.sort_by_key(|key| key.0);
        assert_eq!(vec![first, third], fired);
    }
}
