#[macro_use]
mod macros;
pub mod config;
mod core;

#[macro_use]
extern crate lazy_static;

use crate::config::{Config, LogFormat};
use crate::core::CORE;
use prometheus_client::registry::Registry;
use tracing::{info, metadata::LevelFilter};
use tracing_subscriber::{
    fmt::{
        self,
        format::{Compact, DefaultFields, Json, JsonFields, Pretty},
        time::SystemTime,
        FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Recorder that can record metrics about an event.
pub trait Recorder<Event> {
    /// Record the given event.
    fn record(&self, event: &Event);
}

impl<S, Event> Recorder<Event> for std::sync::Arc<S>
where
    S: Recorder<Event>,
{
    fn record(&self, event: &Event) {
        self.as_ref().record(event);
    }
}

#[derive(Debug)]
pub struct MetricsHandle {
    service_name: String,
    instance_id: String,
}

impl MetricsHandle {
    /// Initialize the tracing subsystem and describe the running service.
    pub fn new(cfg: Config) -> Result<Self, Box<dyn std::error::Error>> {
        init_tracer(cfg.log_format.clone())?;
        info!(
            service_name = cfg.service_name.as_str(),
            instance_id = cfg.instance_id.as_str(),
            version = cfg.version.as_str(),
            build = cfg.build.as_str(),
            "tracing initialized"
        );
        Ok(MetricsHandle {
            service_name: cfg.service_name,
            instance_id: cfg.instance_id,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn register<T, F>(f: F) -> T
    where
        F: FnOnce(&mut Registry) -> T,
    {
        CORE.register(f)
    }

    pub fn encode() -> Vec<u8> {
        CORE.encode()
    }
}

// Implement a FormatEvent type that can be configured to one of a set of log formats.
struct EventFormat {
    kind: LogFormat,
    single: tracing_subscriber::fmt::format::Format<Compact, SystemTime>,
    multi: tracing_subscriber::fmt::format::Format<Pretty, SystemTime>,
    json: tracing_subscriber::fmt::format::Format<Json, SystemTime>,
}

impl EventFormat {
    fn new(kind: LogFormat) -> Self {
        Self {
            kind,
            single: fmt::format().compact(),
            multi: fmt::format().pretty(),
            json: fmt::format().json(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for EventFormat
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        writer: fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        match self.kind {
            LogFormat::SingleLine => self.single.format_event(ctx, writer, event),
            LogFormat::MultiLine => self.multi.format_event(ctx, writer, event),
            LogFormat::Json => self.json.format_event(ctx, writer, event),
        }
    }
}

// Implement a FormatFields type that can be configured to one of a set of log formats.
pub struct FieldsFormat {
    kind: LogFormat,
    default_fields: DefaultFields,
    json_fields: JsonFields,
}

impl FieldsFormat {
    pub fn new(kind: LogFormat) -> Self {
        Self {
            kind,
            default_fields: DefaultFields::new(),
            json_fields: JsonFields::new(),
        }
    }
}

impl<'writer> FormatFields<'writer> for FieldsFormat {
    fn format_fields<R: tracing_subscriber::prelude::__tracing_subscriber_field_RecordFields>(
        &self,
        writer: fmt::format::Writer<'writer>,
        fields: R,
    ) -> std::fmt::Result {
        match self.kind {
            LogFormat::SingleLine => self.default_fields.format_fields(writer, fields),
            LogFormat::MultiLine => self.default_fields.format_fields(writer, fields),
            LogFormat::Json => self.json_fields.format_fields(writer, fields),
        }
    }
}

/// For use in CLI tools that are writing to stdout.
pub fn init_local_tracing() -> Result<(), Box<dyn std::error::Error>> {
    init_tracer(LogFormat::MultiLine)
}

fn init_tracer(log_format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    // Default to INFO if no env is specified
    let filter_builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let log_filter = filter_builder.from_env()?;

    // Configure both the fields and event formats.
    let fields_format = FieldsFormat::new(log_format.clone());
    let event_format = EventFormat::new(log_format);

    let log_subscriber = fmt::layer()
        // The JSON format ignore the ansi setting and always format without colors.
        .with_ansi(true)
        .event_format(event_format)
        .fmt_fields(fields_format)
        .with_filter(log_filter);

    tracing_subscriber::registry()
        .with(log_subscriber)
        .try_init()?;

    Ok(())
}
