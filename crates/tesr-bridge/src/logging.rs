//! Route `tracing` output into the registry's log sink.
//!
//! Each formatted event is buffered by a [`SinkWriter`] and delivered as one
//! `log_message` call when the writer is dropped, so the sink sees whole lines.
//! Messages the registry logs itself for lack of a sink use
//! [`FALLBACK_TARGET`] and are printed on stderr instead.

use std::io;

use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::registry::Bridge;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_FILTER_ENV: &str = "TESR_LOG";

/// Target of messages the registry logs itself when no sink is registered.
/// These go to stderr and are never routed back into a sink.
pub const FALLBACK_TARGET: &str = "tesr_bridge::log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn is_fallback(meta: &tracing::Metadata<'_>) -> bool {
    meta.target() == FALLBACK_TARGET
}

/// Buffers one formatted event and forwards it on drop.
pub struct SinkWriter {
    bridge: &'static dyn Bridge,
    buf: Vec<u8>,
}

impl SinkWriter {
    pub fn new(bridge: &'static dyn Bridge) -> Self {
        Self { bridge, buf: Vec::new() }
    }
}

impl io::Write for SinkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        let line = String::from_utf8_lossy(&self.buf);
        let line = line.trim_end();
        if !line.is_empty() {
            self.bridge.log_message(line);
        }
    }
}

/// Install a global subscriber writing through `bridge`. Does nothing if a
/// subscriber is already set for this module.
pub fn install(bridge: &'static dyn Bridge) {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(sink_layer(bridge))
        .with(stderr_fallback())
        .try_init();
}

fn sink_layer<S>(bridge: &'static dyn Bridge) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .without_time()
        .with_writer(move || SinkWriter::new(bridge))
        .with_filter(filter_fn(|meta| !is_fallback(meta)))
}

/// Install a subscriber that only prints registry fallback messages, for a
/// module that has no sink of its own.
pub fn install_fallback() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_fallback())
        .try_init();
}

fn stderr_fallback<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_level(false)
        .with_writer(io::stderr)
        .with_filter(filter_fn(is_fallback))
}
