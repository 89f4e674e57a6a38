//! Centralized error types for the Rivulet core library.
//!
//! All recoverable failures surface as `Result`s built from the structured
//! types below. The scheduler never terminates the process on an internal
//! error; hosts observe backend failures through [`SchedulerError`] and
//! decide for themselves.

use std::io;

use thiserror::Error;

/// Errors produced by the task scheduler and its readiness backends.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The readiness backend could not be created (e.g. `epoll_create1`
    /// failed). Fatal at scheduler construction.
    #[error("readiness backend initialization failed: {0}")]
    BackendInit(#[source] io::Error),

    /// Waiting for readiness failed with something other than `EINTR`.
    #[error("readiness wait failed: {0}")]
    Backend(#[source] io::Error),

    /// Registering, replacing, or removing a kernel fd watch failed.
    #[error("registration change for fd {fd} failed: {source}")]
    Registration {
        fd: i32,
        #[source]
        source: io::Error,
    },
}

/// Errors produced by the framed pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// `start_playing` was called on a sink that is already playing.
    #[error("sink is already playing")]
    SinkAlreadyPlaying,

    /// `resume_playing` was called on a sink with no bound source.
    #[error("sink has no bound source")]
    SinkNotBound,

    /// A file-backed stage could not open its file.
    #[error("failed to open {path}: {source}")]
    OpenFile {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Convenient Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Convenient Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_init_error_mentions_initialization() {
        let err = SchedulerError::BackendInit(io::Error::from_raw_os_error(libc::EMFILE));
        assert!(err.to_string().contains("initialization"));
    }

    #[test]
    fn registration_error_names_the_fd() {
        let err = SchedulerError::Registration {
            fd: 7,
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        assert!(err.to_string().contains("fd 7"));
    }

    #[test]
    fn open_file_error_names_the_path() {
        let err = PipelineError::OpenFile {
            path: "/no/such/file".to_string(),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(err.to_string().contains("/no/such/file"));
    }
}
