pub mod checksum;
pub mod config;
pub mod error;
pub mod format;
pub mod logpipe;
pub mod net;
pub mod probe;
pub mod segment;
pub mod stall;

#[cfg(test)]
mod tests;

pub use crate::config::{RequestOptions, Settings};
pub use crate::error::{CoreError, CoreResult};
pub use crate::logpipe::{LogHandle, LogPipeline, LogRecord, PipelineState};
pub use crate::net::{configure, HeaderMapping, HttpTransport, TransferConfig};
pub use crate::probe::{probe, ProbeResult};
pub use crate::segment::{plan, segment_size, segment_size_str, split, ByteRange, RangePlan};
