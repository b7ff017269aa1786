//! Threaded runtime for a `Wheel`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use log::{debug, warn};

use crate::wheel::{Firing, Job, Key, Repeat, Wheel, WheelBuilder};

/// Builder for configuring and constructing instances of `Carousel`.
pub struct CarouselBuilder<T> {
    builder: WheelBuilder<T>,
}

impl<T> CarouselBuilder<T>
where
    T: Send + Sync + 'static,
{
    /// Create a builder with the given default job, used for every task that
    /// does not carry its own.
    pub fn new<F>(default_job: F) -> CarouselBuilder<T>
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        CarouselBuilder { builder: WheelBuilder::new(default_job) }
    }

    /// Sets the tick interval of the backing `Wheel`.
    pub fn with_tick_interval(mut self, interval: Duration) -> CarouselBuilder<T> {
        self.builder = self.builder.with_tick_interval(interval);
        self
    }

    /// Get the tick interval that was set.
    pub fn tick_interval(&self) -> Duration {
        self.builder.tick_interval()
    }

    /// Construct a `Carousel` with the current configuration, spawning its
    /// driver thread.
    pub fn build(self) -> Carousel<T> {
        self.into()
    }
}

//--------------------------------------------------------------//

enum Request<T> {
    Schedule(Pending<T>),
    Cancel(Key),
    Exit,
}

struct Pending<T> {
    key: Key,
    repeat: Repeat,
    delay: Duration,
    job: Option<Job<T>>,
    args: Arc<Vec<T>>,
}

/// Handle to a timing wheel driven by a dedicated control-loop thread.
///
/// The loop is the sole owner of the wheel: ticks of the periodic clock and
/// `add`/`cancel`/`exit` requests all funnel through one consumption point,
/// one event per iteration, so no bucket state is ever shared. Submissions
/// are a synchronous hand-off over a rendezvous channel and return once the
/// loop has accepted the request.
///
/// Fired jobs each run on their own spawned thread; the loop never waits for
/// them and never observes their panics.
///
/// Dropping the last handle stops the driver, same as `exit`.
pub struct Carousel<T> {
    requests: Sender<Request<T>>,
    // Keeps the request channel open once the driver has stopped, so a
    // submit issued after exit parks forever instead of erroring out
    _keepalive: Receiver<Request<T>>,
    keys: Arc<AtomicU64>,
    tick_interval: Duration,
}

impl<T> Clone for Carousel<T> {
    fn clone(&self) -> Carousel<T> {
        Carousel {
            requests: self.requests.clone(),
            _keepalive: self._keepalive.clone(),
            keys: self.keys.clone(),
            tick_interval: self.tick_interval,
        }
    }
}

impl<T> From<CarouselBuilder<T>> for Carousel<T>
where
    T: Send + Sync + 'static,
{
    fn from(builder: CarouselBuilder<T>) -> Carousel<T> {
        let wheel = builder.builder.build();
        let keys = wheel.key_counter();
        let tick_interval = wheel.tick_interval();

        // Rendezvous channel: Go-style unbuffered hand-off to the loop
        let (send, recv) = bounded(0);

        let requests = recv.clone();
        thread::spawn(move || run_wheel(wheel, requests));

        Carousel { requests: send, _keepalive: recv, keys, tick_interval }
    }
}

impl<T> Carousel<T>
where
    T: Send + Sync + 'static,
{
    /// Schedule a task that fires once after the given delay, invoking the
    /// wheel's default job with the given arguments.
    ///
    /// Delays shorter than the tick interval are silently raised to one tick.
    pub fn add(&self, delay: Duration, args: Vec<T>) -> Key {
        self.submit(Repeat::Times(1), delay, None, args)
    }

    /// Schedule a task that fires repeatedly at the given delay.
    ///
    /// Continuations reuse the returned key, so one `cancel` covers every
    /// future repeat.
    pub fn add_repeat(&self, repeat: Repeat, delay: Duration, args: Vec<T>) -> Key {
        self.submit(repeat, delay, None, args)
    }

    /// Schedule a single-fire task carrying its own job instead of the
    /// wheel's default.
    pub fn add_with<F>(&self, delay: Duration, job: F, args: Vec<T>) -> Key
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        self.submit(Repeat::Times(1), delay, Some(Arc::new(job)), args)
    }

    /// Schedule a repeating task carrying its own job.
    pub fn add_repeat_with<F>(&self, repeat: Repeat, delay: Duration, job: F, args: Vec<T>) -> Key
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        self.submit(repeat, delay, Some(Arc::new(job)), args)
    }

    /// Remove the task with the given key, if it is currently scheduled.
    ///
    /// Best effort: unknown keys, already-fired tasks and already-cancelled
    /// tasks are an indistinguishable silent no-op. Once the cancel has been
    /// processed no further repeat of that key fires.
    pub fn cancel(&self, key: Key) {
        let _ = self.requests.send(Request::Cancel(key));
    }

    /// Stop the periodic clock and terminate the control loop. Irreversible.
    ///
    /// Pending tasks never fire. Submitting anything after `exit` blocks the
    /// caller forever; callers must not submit once exit was requested.
    pub fn exit(&self) {
        let _ = self.requests.send(Request::Exit);
    }

    /// Tick interval of the backing wheel.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    fn submit(&self, repeat: Repeat, delay: Duration, job: Option<Job<T>>, args: Vec<T>) -> Key {
        let key = Key(self.keys.fetch_add(1, Ordering::Relaxed) + 1);
        let pending = Pending { key, repeat, delay, job, args: Arc::new(args) };

        let _ = self.requests.send(Request::Schedule(pending));
        key
    }
}

/// Run the control loop for a driven wheel.
///
/// Processes exactly one event per iteration: a tick of the periodic clock,
/// or one accepted request. All wheel mutation happens here.
fn run_wheel<T>(mut wheel: Wheel<T>, requests: Receiver<Request<T>>)
where
    T: Send + Sync + 'static,
{
    let ticker = tick(wheel.tick_interval());
    debug!("carousel driver started, tick interval {:?}", wheel.tick_interval());

    loop {
        select! {
            recv(ticker) -> _ => {
                for firing in wheel.tick() {
                    spawn_job(firing);
                }
            },
            recv(requests) -> request => match request {
                Ok(Request::Schedule(pending)) => {
                    wheel.insert(pending.key, pending.repeat, pending.delay, pending.job, pending.args);
                }
                Ok(Request::Cancel(key)) => {
                    wheel.cancel(key);
                }
                // Disconnection means every handle is gone; same terminal
                // state as an explicit exit
                Ok(Request::Exit) | Err(_) => break,
            },
        }
    }

    debug!("carousel driver stopped");
}

/// Hand a due task to its own thread, fire and forget.
fn spawn_job<T>(firing: Firing<T>)
where
    T: Send + Sync + 'static,
{
    let key = firing.key();
    let spawned = thread::Builder::new()
        .name("carousel-job".to_string())
        .spawn(move || firing.invoke());

    if let Err(error) = spawned {
        warn!("dropping fired task {:?}, could not spawn job thread: {}", key, error);
    }
}
