// Logs module - Output capture, line decoration and rotation

mod router;
mod sink;
mod timestamp;

pub use router::{sink_paths, LogRouter};
pub use sink::{LogSink, OutputStream, DEFAULT_MAX_LOG_SIZE};
pub use timestamp::TimestampFormat;
