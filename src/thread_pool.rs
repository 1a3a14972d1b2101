//! EventLoopThread / EventLoopThreadPool: the "one loop per thread"
//! pool that forms the worker side of the multi-reactor model.
//! Grounded in `original_source/include/EventLoopThreadPool.h` /
//! `src/EventLoopThreadPool.cpp` and `include/EventLoopThread.h` /
//! `src/EventLoopThread.cpp`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{ReactorError, Result};
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::hash_ring::ConsistentHashRing;

pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

const HASH_RING_REPLICAS: usize = 5;

enum StartResult {
    Ready(EventLoopHandle),
    Failed(String),
}

struct ThreadShared {
    result: Mutex<Option<StartResult>>,
    cond: Condvar,
}

/// Owns exactly one worker thread and the `EventLoop` constructed on it.
/// The loop itself never leaves that thread; only its `EventLoopHandle`
/// escapes, via `start_loop`.
struct EventLoopThread {
    shared: Arc<ThreadShared>,
    join: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    fn spawn(name: String, init_cb: Option<ThreadInitCallback>) -> EventLoopThread {
        let shared = Arc::new(ThreadShared { result: Mutex::new(None), cond: Condvar::new() });
        let thread_shared = shared.clone();

        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(l) => l,
                    Err(e) => {
                        let mut result = thread_shared.result.lock().unwrap();
                        *result = Some(StartResult::Failed(e.to_string()));
                        thread_shared.cond.notify_one();
                        return;
                    }
                };

                if let Some(cb) = init_cb.as_ref() {
                    cb(&event_loop);
                }

                {
                    let mut result = thread_shared.result.lock().unwrap();
                    *result = Some(StartResult::Ready(event_loop.handle()));
                    thread_shared.cond.notify_one();
                }

                event_loop.run();
            })
            .expect("failed to spawn worker thread");

        EventLoopThread { shared, join: Some(join) }
    }

    /// Blocks until the spawned thread's `EventLoop` is fully constructed
    /// (and any `ThreadInitCallback` has run), mirroring the C++
    /// mutex+condvar construction barrier.
    fn start_loop(&self) -> Result<EventLoopHandle> {
        let mut result = self.shared.result.lock().unwrap();
        while result.is_none() {
            result = self.shared.cond.wait(result).unwrap();
        }
        match result.take().unwrap() {
            StartResult::Ready(handle) => {
                *result = Some(StartResult::Ready(handle.clone()));
                Ok(handle)
            }
            StartResult::Failed(msg) => {
                *result = Some(StartResult::Failed(msg.clone()));
                Err(ReactorError::EventLoopThreadFailed(msg))
            }
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let handle = match &*self.shared.result.lock().unwrap() {
            Some(StartResult::Ready(handle)) => Some(handle.clone()),
            _ => None,
        };
        if let Some(handle) = handle {
            handle.quit();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A pool of worker loops, dispatched by consistent hash on a
/// per-connection key (typically the peer's "ip:port"), falling back to the
/// single base loop when `num_threads == 0`.
pub struct EventLoopThreadPool {
    base_loop: EventLoopHandle,
    name: String,
    started: AtomicBool,
    num_threads: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<EventLoopHandle>,
    hash_ring: ConsistentHashRing,
    name2loop: HashMap<String, EventLoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: &EventLoop, name: impl Into<String>, num_threads: usize) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop: base_loop.handle(),
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads,
            threads: Vec::new(),
            loops: Vec::new(),
            hash_ring: ConsistentHashRing::new(HASH_RING_REPLICAS),
            name2loop: HashMap::new(),
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawns `num_threads` worker threads, each blocked on until its loop
    /// exists; if `num_threads == 0`, runs `init_cb` directly against
    /// `base_loop` instead (single-thread fallback).
    pub fn start(&mut self, base_loop: &EventLoop, init_cb: Option<ThreadInitCallback>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ReactorError::PoolAlreadyStarted);
        }

        for i in 0..self.num_threads {
            let thread_name = format!("{}{}", self.name, i);
            let thread = EventLoopThread::spawn(thread_name.clone(), init_cb.clone());
            let handle = thread.start_loop()?;
            self.hash_ring.add_node(&thread_name);
            self.name2loop.insert(thread_name, handle.clone());
            self.loops.push(handle);
            self.threads.push(thread);
        }

        if self.num_threads == 0 {
            if let Some(cb) = init_cb {
                cb(base_loop);
            }
        }

        Ok(())
    }

    /// Consistent-hash dispatch on `key` when
    /// worker threads exist, else always the base loop.
    pub fn get_next_loop(&self, key: &str) -> EventLoopHandle {
        if self.num_threads > 0 {
            let node = self.hash_ring.get_node(key).expect("hash ring populated before dispatch");
            self.name2loop.get(&node).cloned().expect("hash ring node always has a mapped loop")
        } else {
            self.base_loop.clone()
        }
    }

    pub fn get_all_loops(&self) -> Vec<EventLoopHandle> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }
}
