//! Process-wide usage context shared by every pipeline stage.
//!
//! An [`Environment`] bundles the scheduler with two diagnostic channels:
//! a mutable "last result" message that stages update when something goes
//! wrong mid-pipeline, and a [`MessageSink`] for human-directed output.
//! Exactly one environment per running instance is the expected shape; it
//! is cheap to clone and lives for the program's duration.

use std::cell::RefCell;
use std::rc::Rc;

use crate::scheduler::TaskScheduler;

/// Destination for human-directed messages emitted by pipeline stages.
///
/// Stages depend on this trait rather than a concrete output stream,
/// keeping the core testable and letting hosts route messages wherever
/// they like.
pub trait MessageSink {
    /// Emits one message line.
    fn message(&self, text: &str);
}

/// Default sink: routes messages through the `log` facade.
pub struct LogMessageSink;

impl MessageSink for LogMessageSink {
    fn message(&self, text: &str) {
        log::info!("[Env] {text}");
    }
}

/// Sink that writes directly to stderr, for simple console hosts.
pub struct StderrMessageSink;

impl MessageSink for StderrMessageSink {
    fn message(&self, text: &str) {
        eprintln!("{text}");
    }
}

/// Sink that records messages at tracing debug level.
///
/// Useful for debugging message flow in development environments.
pub struct TracingMessageSink;

impl MessageSink for TracingMessageSink {
    fn message(&self, text: &str) {
        tracing::debug!(%text, "environment_message");
    }
}

/// No-op sink. Messages are silently discarded.
pub struct NoopMessageSink;

impl MessageSink for NoopMessageSink {
    fn message(&self, _text: &str) {
        // No-op
    }
}

struct EnvInner {
    scheduler: Rc<TaskScheduler>,
    result_msg: RefCell<String>,
    sink: Box<dyn MessageSink>,
}

/// Cheaply-cloneable handle to the process-wide context.
#[derive(Clone)]
pub struct Environment {
    inner: Rc<EnvInner>,
}

impl Environment {
    /// Creates an environment around `scheduler` with the default
    /// log-backed message sink.
    pub fn new(scheduler: Rc<TaskScheduler>) -> Self {
        Self::with_message_sink(scheduler, Box::new(LogMessageSink))
    }

    /// Creates an environment with a custom message sink.
    pub fn with_message_sink(scheduler: Rc<TaskScheduler>, sink: Box<dyn MessageSink>) -> Self {
        Self {
            inner: Rc::new(EnvInner {
                scheduler,
                result_msg: RefCell::new(String::new()),
                sink,
            }),
        }
    }

    /// The scheduler driving this environment.
    pub fn scheduler(&self) -> &Rc<TaskScheduler> {
        &self.inner.scheduler
    }

    /// The current "last result" diagnostic message.
    pub fn result_msg(&self) -> String {
        self.inner.result_msg.borrow().clone()
    }

    /// Replaces the "last result" diagnostic message.
    pub fn set_result_msg(&self, msg: impl Into<String>) {
        *self.inner.result_msg.borrow_mut() = msg.into();
    }

    /// Appends to the "last result" diagnostic message.
    pub fn append_result_msg(&self, msg: &str) {
        self.inner.result_msg.borrow_mut().push_str(msg);
    }

    /// Emits a message through the configured sink.
    pub fn message(&self, text: &str) {
        self.inner.sink.message(text);
    }
}
