//! Stream notifications: level-triggered events collected through an
//! [EventQueue], or edge-triggered callbacks.
//!
//! An [Event] moves between three states:
//!
//! ```text
//!            arm                raise
//!   +------+ ----> +------+  ---------> +------+
//!   | IDLE |       | DOWN |             |  UP  |
//!   +------+ <---- +------+ <---------  +------+
//!            idle             down / get
//! ```
//!
//! Only `UP` events are reported by [EventQueue::get], which moves them back
//! to `DOWN`. The engine raises a stream's event again for as long as the
//! condition holds.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use crate::ctx::StreamHandle;
use crate::{Error, Result};

/// Function invoked when a stream becomes readable, writable, or fails.
///
/// Callbacks run synchronously inside the bulk call that triggered them and
/// with no engine lock held.
pub type Callback = Arc<dyn Fn(StreamHandle) + Send + Sync>;

/// State of an [Event].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Ignored by `raise`; `arm` moves it to `Down`.
    Idle,
    /// Waiting to be raised.
    Down,
    /// Raised and reported by the next [EventQueue::get].
    Up,
}

#[derive(Debug)]
struct Entry {
    state: EventState,
    data: u64,
    /// The entry's key is present in the ready list.
    queued: bool,
}

#[derive(Debug)]
struct Inner {
    events: Slab<Entry>,
    ready: VecDeque<usize>,
    max: usize,
}

/// Bounded set of events with a list of raised ones.
#[derive(Debug, Clone)]
pub struct EventQueue {
    inner: Arc<Mutex<Inner>>,
}

impl EventQueue {
    /// Creates a queue holding at most `max` events.
    ///
    /// # Errors
    ///
    /// Returns an error if `max` is 0 or the storage cannot be reserved.
    pub fn new(max: usize) -> Result<Self> {
        if max == 0 {
            return Err(Error::InvalidConfig("event queue capacity must be non-zero"));
        }

        let mut ready = VecDeque::new();
        ready
            .try_reserve_exact(max)
            .map_err(|_| Error::OutOfResources("event queue"))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                events: Slab::with_capacity(max),
                ready,
                max,
            })),
        })
    }

    /// Allocates an event in the `Down` state carrying `data`, which is what
    /// [EventQueue::get] reports for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue already holds `max` events.
    pub fn alloc(&self, data: u64) -> Result<Event> {
        let mut inner = self.inner.lock();

        if inner.events.len() >= inner.max {
            return Err(Error::OutOfResources("event queue full"));
        }

        let key = inner.events.insert(Entry {
            state: EventState::Down,
            data,
            queued: false,
        });

        Ok(Event {
            queue: Arc::clone(&self.inner),
            key,
        })
    }

    /// Moves up to `max` raised events to `Down`, appending their data to
    /// `out` in the order they were raised. Returns the number reported.
    pub fn get(&self, out: &mut Vec<u64>, max: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut n = 0;

        while n < max {
            let Some(key) = inner.ready.pop_front() else {
                break;
            };

            let Some(entry) = inner.events.get_mut(key) else {
                continue;
            };

            entry.queued = false;

            if entry.state == EventState::Up {
                entry.state = EventState::Down;
                out.push(entry.data);
                n += 1;
            }
        }

        n
    }

    /// Returns the number of allocated events.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Returns `true` if no events are allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to one event of an [EventQueue].
#[derive(Clone)]
pub struct Event {
    queue: Arc<Mutex<Inner>>,
    key: usize,
}

impl Event {
    /// Raises a `Down` event. `Idle` and `Up` events are unchanged.
    pub fn raise(&self) {
        let mut inner = self.queue.lock();
        let Inner { events, ready, .. } = &mut *inner;

        if let Some(entry) = events.get_mut(self.key)
            && entry.state == EventState::Down
        {
            entry.state = EventState::Up;

            if !entry.queued {
                entry.queued = true;
                ready.push_back(self.key);
            }
        }
    }

    /// Moves a raised event back to `Down`.
    pub fn down(&self) {
        self.transition(|state| match state {
            EventState::Up => EventState::Down,
            other => other,
        });
    }

    /// Moves the event to `Idle`.
    pub fn idle(&self) {
        self.transition(|_| EventState::Idle);
    }

    /// Moves an `Idle` event to `Down`.
    pub fn arm(&self) {
        self.transition(|state| match state {
            EventState::Idle => EventState::Down,
            other => other,
        });
    }

    fn transition(&self, f: impl FnOnce(EventState) -> EventState) {
        if let Some(entry) = self.queue.lock().events.get_mut(self.key) {
            entry.state = f(entry.state);
        }
    }

    /// Returns the state of the event, `None` once it is freed.
    pub fn state(&self) -> Option<EventState> {
        self.queue.lock().events.get(self.key).map(|entry| entry.state)
    }

    /// Returns the data reported for the event, `None` once it is freed.
    pub fn data(&self) -> Option<u64> {
        self.queue.lock().events.get(self.key).map(|entry| entry.data)
    }

    /// Returns the event to its queue. Clones of the handle become inert.
    pub fn free(self) {
        let mut inner = self.queue.lock();

        if inner.events.try_remove(self.key).is_some() {
            let key = self.key;
            inner.ready.retain(|&queued| queued != key);
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("key", &self.key).finish()
    }
}

/// Notification parameters: at most one of `event` and `callback` may be
/// set.
#[derive(Clone, Default)]
pub struct NotifyParams {
    /// Event raised while the condition holds.
    pub event: Option<Event>,
    /// Callback invoked when the condition starts to hold.
    pub callback: Option<Callback>,
}

impl fmt::Debug for NotifyParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyParams")
            .field("event", &self.event)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Notification attached to one direction of a stream.
#[derive(Clone, Default)]
pub enum Notify {
    /// No notification.
    #[default]
    None,
    /// Level-triggered event.
    Event(Event),
    /// Edge-triggered callback.
    Callback(Callback),
}

impl TryFrom<NotifyParams> for Notify {
    type Error = Error;

    fn try_from(params: NotifyParams) -> Result<Self> {
        match (params.event, params.callback) {
            (None, None) => Ok(Notify::None),
            (Some(event), None) => Ok(Notify::Event(event)),
            (None, Some(callback)) => Ok(Notify::Callback(callback)),
            (Some(_), Some(_)) => Err(Error::InvalidConfig(
                "notification sets both an event and a callback",
            )),
        }
    }
}

impl From<&Notify> for NotifyParams {
    fn from(notify: &Notify) -> Self {
        match notify {
            Notify::None => NotifyParams::default(),
            Notify::Event(event) => NotifyParams {
                event: Some(event.clone()),
                callback: None,
            },
            Notify::Callback(callback) => NotifyParams {
                event: None,
                callback: Some(Arc::clone(callback)),
            },
        }
    }
}

impl Notify {
    /// Signals that the condition holds. Events are raised every time;
    /// callbacks are collected into `pending` only when `edge` is set.
    pub(crate) fn signal(&self, handle: StreamHandle, edge: bool, pending: &mut Pending) {
        match self {
            Notify::None => {}
            Notify::Event(event) => event.raise(),
            Notify::Callback(callback) if edge => {
                pending.0.push((Arc::clone(callback), handle));
            }
            Notify::Callback(_) => {}
        }
    }

    /// Re-evaluates a level-triggered event after the user consumed from
    /// the stream.
    pub(crate) fn settle(&self, still_ready: bool) {
        if let Notify::Event(event) = self {
            if still_ready {
                event.raise();
            } else {
                event.down();
            }
        }
    }
}

impl fmt::Debug for Notify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notify::None => f.write_str("None"),
            Notify::Event(event) => f.debug_tuple("Event").field(event).finish(),
            Notify::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Callbacks collected under stream locks, invoked once the locks are
/// released.
#[derive(Default)]
pub(crate) struct Pending(Vec<(Callback, StreamHandle)>);

impl Pending {
    pub(crate) fn fire(self) {
        for (callback, handle) in self.0 {
            callback(handle);
        }
    }
}
