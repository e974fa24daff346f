pub mod logging;
pub mod path_resolver;
pub mod sink;

pub use sink::{CollectingSink, ConsoleSink, LogForwardingSink, LogSink};
