//! The configuration-fatal error kind returned from constructors.
//! Per-connection transient/fatal errors, accept overload, and
//! high-water-mark signalling are *not* represented here — those are
//! observable state changes (a close, a log line, a callback), not
//! `Result::Err`s (see DESIGN.md).

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("failed to create listening socket: {0}")]
    ListenerCreation(#[source] io::Error),

    #[error("failed to create eventfd: {0}")]
    EventFdCreation(#[source] io::Error),

    #[error("failed to create timerfd: {0}")]
    TimerFdCreation(#[source] io::Error),

    #[error("failed to create epoll instance: {0}")]
    PollerCreation(#[source] io::Error),

    #[error("an EventLoop already exists on this thread")]
    DuplicateEventLoopOnThread,

    #[error("EventLoopThreadPool already started")]
    PoolAlreadyStarted,

    #[error("worker thread failed to construct its EventLoop: {0}")]
    EventLoopThreadFailed(String),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
