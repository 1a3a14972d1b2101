//! EventLoop: the single-threaded cooperative executor.
//! Grounded in `original_source/src/EventLoop.cpp`.
//!
//! Ownership shape chosen for this rewrite (see DESIGN.md):
//! `EventLoop` itself owns the `Poller` and every `Channel` registered on
//! it, in a generational slab (`GenSlab`). It is neither `Send` nor `Sync`
//! and never crosses a thread boundary. A cheap, `Clone + Send + Sync`
//! `EventLoopHandle` is what `TcpConnection`/`Acceptor`/the thread pool
//! hand around; it can only enqueue closures of type
//! `Box<dyn FnOnce(&EventLoop) + Send>` onto the loop's inbox, or wake/quit
//! it — it never reaches the channel slab directly. Closures only ever see
//! `&EventLoop` while running *on* the loop thread, which is what makes
//! direct access to the (otherwise un-synchronized) slab sound.
//!
//! The thread-local "loop in this thread" pointer backs the affinity check
//! below, and also lets a same-thread `EventLoopHandle` reach its
//! `EventLoop` for a synchronous `run_in_loop` call without an `Rc` cycle.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use crate::channel::{Channel, ChannelState};
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::error::{ReactorError, Result};
use crate::log_sink::{log_sink, LogCrateSink, LogSink, Severity};
use crate::poll::{self, Poller, Ready};
use crate::sys::eventfd::EventFd;
use crate::timer::TimerQueue;

pub(crate) type Task = Box<dyn FnOnce(&EventLoop) + Send>;

thread_local! {
    static CURRENT_LOOP: Cell<Option<NonNull<EventLoop>>> = Cell::new(None);
    // Set in the constructor, cleared in `Drop` — independent of `CURRENT_LOOP`,
    // which is only valid for the (possibly shorter, possibly absent) span of
    // an actual `run()` call. This is what makes "one EventLoop per thread" a
    // constructor-time guarantee rather than a run()-time one.
    static LOOP_CONSTRUCTED: Cell<bool> = Cell::new(false);
}

/// Opaque, generation-checked reference to a registered `Channel`. Valid
/// only on the `EventLoop` that issued it. The generation is packed
/// alongside the slab key into the epoll token (see `token_for`), so a
/// stale event collected in one poll batch before a same-batch removal is
/// recognized as stale rather than misrouted to whatever channel later
/// reused the same slab slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId {
    key: usize,
    generation: u32,
}

struct ChannelSlot {
    generation: u32,
    channel: Option<Channel>,
}

/// Generational wrapper over `slab::Slab`, realizing the slab-index
/// lifetime-safety option for every `Channel`'s registration, not just the
/// `TcpConnection` tie.
struct GenSlab {
    slots: slab::Slab<ChannelSlot>,
    next_generation: u32,
}

impl GenSlab {
    fn new() -> GenSlab {
        GenSlab { slots: slab::Slab::new(), next_generation: 1 }
    }

    fn insert(&mut self, channel: Channel) -> ChannelId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let key = self.slots.insert(ChannelSlot { generation, channel: Some(channel) });
        ChannelId { key, generation }
    }

    fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.slots
            .get(id.key)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.channel.as_ref())
    }

    fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.slots
            .get_mut(id.key)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.channel.as_mut())
    }

    fn remove(&mut self, id: ChannelId) -> Option<Channel> {
        if self.slots.get(id.key).map(|s| s.generation) != Some(id.generation) {
            return None;
        }
        self.slots.remove(id.key).channel
    }
}

/// Cross-thread-safe half of an `EventLoop`: everything a remote thread is
/// allowed to touch.
struct Shared {
    pending: Mutex<VecDeque<Task>>,
    waker: EventFd,
    quit: AtomicBool,
    draining: AtomicBool,
    thread_id: ThreadId,
}

#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

impl EventLoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread_id
    }

    /// Executes synchronously if already on-loop, else queues.
    pub fn run_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        if self.is_in_loop_thread() {
            CURRENT_LOOP.with(|cell| {
                if let Some(ptr) = cell.get() {
                    // SAFETY: `is_in_loop_thread` confirmed we are executing
                    // on the thread that owns this EventLoop, and the
                    // thread-local is only ever set for the lifetime of
                    // that EventLoop's existence on this thread.
                    f(unsafe { ptr.as_ref() });
                }
            });
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Appends to the inbox under lock; wakes the loop if the
    /// caller is off-loop or the loop is currently draining the inbox.
    pub fn queue_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push_back(Box::new(f));
        }

        if !self.is_in_loop_thread() || self.shared.draining.load(Ordering::Acquire) {
            let _ = self.shared.waker.write(1);
        }
    }

    /// Sets a flag; wakes the loop if called off-loop.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            let _ = self.shared.waker.write(1);
        }
    }
}

pub struct EventLoop {
    shared: Arc<Shared>,
    poller: RefCell<Poller>,
    channels: RefCell<GenSlab>,
    active: RefCell<Vec<poll::Event>>,
    timer_queue: RefCell<TimerQueue>,
    timer_fd: crate::sys::timerfd::TimerFd,
    timer_channel: ChannelId,
    wakeup_channel: ChannelId,
    log_sink: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
    // `RefCell` already makes this !Sync; a raw-pointer marker additionally
    // makes it !Send, so the loop can't be constructed on one thread and
    // handed to another before `run()` — `shared.thread_id` is fixed at
    // construction and every `is_in_loop_thread` check trusts it.
    _not_send: std::marker::PhantomData<*mut ()>,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop> {
        Self::with_log_sink(Arc::new(LogCrateSink))
    }

    pub fn with_log_sink(log_sink: Arc<dyn LogSink>) -> Result<EventLoop> {
        let already_exists = LOOP_CONSTRUCTED.with(|cell| cell.get());
        if already_exists {
            return Err(ReactorError::DuplicateEventLoopOnThread);
        }

        let poller = Poller::new().map_err(ReactorError::PollerCreation)?;
        let waker = EventFd::new().map_err(ReactorError::EventFdCreation)?;
        let timer_fd = crate::sys::timerfd::TimerFd::new().map_err(ReactorError::TimerFdCreation)?;

        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            waker,
            quit: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            thread_id: std::thread::current().id(),
        });

        let mut channels = GenSlab::new();
        let wakeup_channel = channels.insert(Channel::new(shared.waker.as_raw_fd()));
        let timer_channel = channels.insert(Channel::new(timer_fd.as_raw_fd()));

        let event_loop = EventLoop {
            shared,
            poller: RefCell::new(poller),
            channels: RefCell::new(channels),
            active: RefCell::new(Vec::new()),
            timer_queue: RefCell::new(TimerQueue::new()),
            timer_fd,
            timer_channel,
            wakeup_channel,
            log_sink,
            clock: Arc::new(SystemClock),
            _not_send: std::marker::PhantomData,
        };

        event_loop.poller.borrow().add(
            event_loop.shared.waker.as_raw_fd(),
            token_for(wakeup_channel),
            Ready::readable(),
        ).map_err(ReactorError::EventFdCreation)?;
        event_loop.channels.borrow_mut().get_mut(wakeup_channel).unwrap().set_state(ChannelState::Added);
        event_loop.channels.borrow_mut().get_mut(wakeup_channel).unwrap().set_interest(Ready::readable());

        event_loop.poller.borrow().add(
            event_loop.timer_fd.as_raw_fd(),
            token_for(timer_channel),
            Ready::readable(),
        ).map_err(ReactorError::TimerFdCreation)?;
        event_loop.channels.borrow_mut().get_mut(timer_channel).unwrap().set_state(ChannelState::Added);
        event_loop.channels.borrow_mut().get_mut(timer_channel).unwrap().set_interest(Ready::readable());

        LOOP_CONSTRUCTED.with(|cell| cell.set(true));
        Ok(event_loop)
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle { shared: self.shared.clone() }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn log_sink(&self) -> Arc<dyn LogSink> {
        self.log_sink.clone()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread_id
    }

    /// Registers a new `Channel` for `fd` with the given callbacks,
    /// initially with no interest. Returns the `ChannelId` the owner keeps.
    pub(crate) fn add_channel(&self, fd: RawFd) -> ChannelId {
        self.channels.borrow_mut().insert(Channel::new(fd))
    }

    pub(crate) fn set_read_callback(&self, id: ChannelId, cb: crate::channel::ReadCallback) {
        if let Some(ch) = self.channels.borrow_mut().get_mut(id) {
            ch.set_read_callback(cb);
        }
    }

    pub(crate) fn set_write_callback(&self, id: ChannelId, cb: crate::channel::WriteCallback) {
        if let Some(ch) = self.channels.borrow_mut().get_mut(id) {
            ch.set_write_callback(cb);
        }
    }

    pub(crate) fn set_close_callback(&self, id: ChannelId, cb: crate::channel::CloseCallback) {
        if let Some(ch) = self.channels.borrow_mut().get_mut(id) {
            ch.set_close_callback(cb);
        }
    }

    pub(crate) fn set_error_callback(&self, id: ChannelId, cb: crate::channel::ErrorCallback) {
        if let Some(ch) = self.channels.borrow_mut().get_mut(id) {
            ch.set_error_callback(cb);
        }
    }

    pub(crate) fn is_writing(&self, id: ChannelId) -> bool {
        self.channels.borrow().get(id).map(|c| c.is_writing()).unwrap_or(false)
    }

    pub(crate) fn is_reading(&self, id: ChannelId) -> bool {
        self.channels.borrow().get(id).map(|c| c.is_reading()).unwrap_or(false)
    }

    pub(crate) fn fd_of(&self, id: ChannelId) -> Option<RawFd> {
        self.channels.borrow().get(id).map(|c| c.fd())
    }

    /// Poller state-transition table, driven from interest mutation: every
    /// mutation synchronously notifies the owning loop, which forwards to
    /// the Poller.
    pub(crate) fn update_channel_interest(&self, id: ChannelId, interest: Ready) {
        debug_assert!(self.is_in_loop_thread(), "update_channel_interest called off the loop thread");

        let (fd, state) = {
            let channels = self.channels.borrow();
            match channels.get(id) {
                Some(ch) => (ch.fd(), ch.state()),
                None => return,
            }
        };

        let result = match state {
            ChannelState::New if !interest.is_empty() => self.poller.borrow().add(fd, token_for(id), interest),
            ChannelState::New => Ok(()),
            ChannelState::Added if interest.is_empty() => self.poller.borrow().remove(fd),
            ChannelState::Added => self.poller.borrow().modify(fd, token_for(id), interest),
            ChannelState::Deleted if !interest.is_empty() => self.poller.borrow().add(fd, token_for(id), interest),
            ChannelState::Deleted => Ok(()),
        };

        if let Err(e) = result {
            log_sink!(self.log_sink, Severity::Error, "EventLoop::update_channel_interest fd={} {}", fd, e);
            return;
        }

        let mut channels = self.channels.borrow_mut();
        if let Some(ch) = channels.get_mut(id) {
            ch.set_interest(interest);
            ch.set_state(match state {
                ChannelState::New if !interest.is_empty() => ChannelState::Added,
                ChannelState::New => ChannelState::New,
                ChannelState::Added if interest.is_empty() => ChannelState::Deleted,
                ChannelState::Added => ChannelState::Added,
                ChannelState::Deleted if !interest.is_empty() => ChannelState::Added,
                ChannelState::Deleted => ChannelState::Deleted,
            });
        }
    }

    /// Fully removes a channel from both the Poller and this loop's slab.
    /// After this call its `ChannelId` dereferences to `None` everywhere —
    /// the structural "tie" described at the top of this module.
    pub(crate) fn remove_channel(&self, id: ChannelId) {
        debug_assert!(self.is_in_loop_thread(), "remove_channel called off the loop thread");

        let fd_and_state = self.channels.borrow().get(id).map(|c| (c.fd(), c.state()));
        if let Some((fd, state)) = fd_and_state {
            if state == ChannelState::Added {
                if let Err(e) = self.poller.borrow().remove(fd) {
                    log_sink!(self.log_sink, Severity::Error, "EventLoop::remove_channel fd={} {}", fd, e);
                }
            }
        }
        self.channels.borrow_mut().remove(id);
    }

    /// `runAt`.
    pub fn run_at(&self, when: Timestamp, f: impl FnMut() + 'static) -> crate::timer::TimerId {
        self.schedule_timer(Box::new(f), when, 0.0)
    }

    /// `runAfter`.
    pub fn run_after(&self, delay_seconds: f64, f: impl FnMut() + 'static) -> crate::timer::TimerId {
        let when = self.clock.now().add_seconds(delay_seconds);
        self.schedule_timer(Box::new(f), when, 0.0)
    }

    /// `runEvery`.
    pub fn run_every(&self, interval_seconds: f64, f: impl FnMut() + 'static) -> crate::timer::TimerId {
        let when = self.clock.now().add_seconds(interval_seconds);
        self.schedule_timer(Box::new(f), when, interval_seconds)
    }

    pub fn cancel_timer(&self, id: crate::timer::TimerId) {
        self.timer_queue.borrow_mut().cancel(id);
    }

    fn schedule_timer(&self, cb: Box<dyn FnMut()>, when: Timestamp, interval: f64) -> crate::timer::TimerId {
        let (id, became_earliest) = self.timer_queue.borrow_mut().add_timer(cb, when, interval);
        if became_earliest {
            let delay = (when.micros_since_epoch() - self.clock.now().micros_since_epoch()).max(100) as u64;
            let _ = self.timer_fd.arm(Duration::from_micros(delay));
        }
        id
    }

    /// Runs until `quit()`. Per iteration: poll, dispatch active channels in
    /// order, drain the task inbox.
    pub fn run(&self) {
        let self_ptr = NonNull::from(self);
        CURRENT_LOOP.with(|cell| cell.set(Some(self_ptr)));

        while !self.shared.quit.load(Ordering::Acquire) {
            let mut active = self.active.borrow_mut();
            let now = match self.poller.borrow_mut().poll(Some(Duration::from_millis(10_000)), &mut *active) {
                Ok(now) => now,
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    log_sink!(self.log_sink, Severity::Error, "Poller::poll: {}", e);
                    continue;
                }
            };

            let events: Vec<_> = active.iter().copied().collect();
            drop(active);

            for event in events {
                let id = channel_id_from_token(event.token());
                if id == self.wakeup_channel {
                    let _ = self.shared.waker.read();
                    continue;
                }
                if id == self.timer_channel {
                    let _ = self.timer_fd.read();
                    self.fire_timers(now);
                    continue;
                }

                let mut channels = self.channels.borrow_mut();
                if let Some(ch) = channels.get_mut(id) {
                    ch.set_returned(event.readiness());
                } else {
                    continue;
                }
                drop(channels);

                // Dispatch outside the borrow: handler closures may
                // themselves call back into this EventLoop (e.g.
                // `remove_channel`), which would otherwise double-borrow.
                self.dispatch(id, now);
            }

            self.do_pending_tasks();
        }

        CURRENT_LOOP.with(|cell| cell.set(None));
    }

    fn dispatch(&self, id: ChannelId, now: Timestamp) {
        // Temporarily move the Channel out of the slab so its callbacks
        // (which may themselves touch other channels, or this one, via
        // `run_in_loop`) don't need to re-enter a borrowed `RefCell`.
        let mut channel = self.take_channel(id);

        if let Some(ch) = channel.as_mut() {
            ch.handle_event(now);
        }

        self.return_channel(id, channel);
    }

    fn take_channel(&self, id: ChannelId) -> Option<Channel> {
        let mut channels = self.channels.borrow_mut();
        let slot = channels.slots.get_mut(id.key)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.channel.take()
    }

    fn return_channel(&self, id: ChannelId, channel: Option<Channel>) {
        if let Some(channel) = channel {
            let mut channels = self.channels.borrow_mut();
            if let Some(slot) = channels.slots.get_mut(id.key) {
                if slot.generation == id.generation {
                    slot.channel = Some(channel);
                }
            }
        }
    }

    fn fire_timers(&self, now: Timestamp) {
        let next = self.timer_queue.borrow_mut().fire(now);
        if let Some(next) = next {
            let delay = (next.micros_since_epoch() - now.micros_since_epoch()).max(100) as u64;
            let _ = self.timer_fd.arm(Duration::from_micros(delay));
        }
    }

    /// Swap the pending vector under lock, execute outside the lock; reset
    /// the draining flag on exit.
    fn do_pending_tasks(&self) {
        self.shared.draining.store(true, Ordering::Release);

        let tasks: Vec<Task> = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.drain(..).collect()
        };

        for task in tasks {
            task(self);
        }

        self.shared.draining.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|cell| {
            if let Some(ptr) = cell.get() {
                if std::ptr::eq(ptr.as_ptr(), self as *mut EventLoop) {
                    cell.set(None);
                }
            }
        });
        LOOP_CONSTRUCTED.with(|cell| cell.set(false));
    }
}

// Token <-> ChannelId packing: high 32 bits are the generation, low 32
// bits the slab key. usize is 64-bit on every target this crate supports
// (Linux epoll's own ABI already assumes as much for `epoll_event.data`).
fn token_for(id: ChannelId) -> poll::Token {
    let packed = ((id.generation as u64) << 32) | (id.key as u64 & 0xFFFF_FFFF);
    poll::Token(packed as usize)
}

fn channel_id_from_token(token: poll::Token) -> ChannelId {
    let packed = token.0 as u64;
    ChannelId {
        key: (packed & 0xFFFF_FFFF) as usize,
        generation: (packed >> 32) as u32,
    }
}
