//! Rivulet Core - single-threaded streaming-media plumbing.
//!
//! This crate provides the engine underneath a streaming-media stack: a
//! cooperative event loop and a pull-mode framed pipeline. All I/O,
//! timing, data transfer, and framing run as asynchronous
//! producer/consumer chains driven by one scheduler thread.
//!
//! # Architecture
//!
//! The crate is organized into a few modules:
//!
//! - [`scheduler`]: the event loop: timed alarms, fd readiness dispatch
//!   over pluggable `select`/`epoll` backends, and cross-thread event
//!   triggers
//! - [`pipeline`]: framed sources, filters, and sinks pulling one frame at
//!   a time through sink-owned buffers
//! - [`env`]: the process-wide context (scheduler handle, diagnostic
//!   result message, message output sink)
//! - [`error`]: centralized error types
//!
//! # Threading
//!
//! Exactly one thread runs [`TaskScheduler::do_event_loop`]; every
//! callback fires on that thread and must not block. The single crossing
//! point for other threads is [`TriggerHandle::trigger_event`], plus the
//! atomic watch variable that stops the loop.

#![warn(clippy::all)]

pub mod env;
pub mod error;
pub mod pipeline;
pub mod scheduler;

// Re-export commonly used types at the crate root
pub use env::{
    Environment, LogMessageSink, MessageSink, NoopMessageSink, StderrMessageSink,
    TracingMessageSink,
};
pub use error::{PipelineError, PipelineResult, SchedulerError, SchedulerResult};
pub use pipeline::{
    ByteStreamSource, ConsumeOutcome, FileSink, FrameAccumulator, FrameBuffer, FrameCallback,
    FrameConsumer, FrameDelivery, FrameInfo, FramedSource, HeaderPrefixFilter, MediaSink,
    MemoryBufferSource, QueueProducer, QueuedFrameSource,
};
pub use scheduler::{
    BackendKind, ConditionSet, EventTriggerId, TaskScheduler, TaskToken, TriggerHandle,
    TriggerPayload, MAX_EVENT_TRIGGERS,
};
