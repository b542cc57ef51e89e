//! Tracing subscriber setup shared by the fleet services.
//!
//! Settings come from the environment:
//!
//! | Variable        | Values                         | Default             |
//! |-----------------|--------------------------------|---------------------|
//! | `LOG_LEVEL`     | any `EnvFilter` directive      | `info`              |
//! | `LOG_OUTPUT`    | `console`, `file`, `both`      | `console`           |
//! | `LOG_FORMAT`    | `human`, `json`                | `human`             |
//! | `LOG_TAGS`      | `key:value,...` span filters   | none                |
//! | `LOG_FILE_PATH` | path of the rolling log file   | `/tmp/vm-api.log`   |
//!
//! `RUST_LOG` still wins over `LOG_LEVEL` when set.

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry,
    registry::LookupSpan,
    EnvFilter,
};

/// Crates that are too chatty at `debug`.
const QUIET_TARGETS: &[&str] = &["tokio=warn", "hyper=warn", "sqlx=warn", "reqwest=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// A `key:value` requirement on the fields of the enclosing spans.
/// A value of `*` only requires the key to be present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanTag {
    pub key: String,
    pub value: String,
}

impl SpanTag {
    fn matches(&self, fields: &HashMap<String, String>) -> bool {
        fields
            .get(&self.key)
            .is_some_and(|v| self.value == "*" || v.contains(&self.value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub tags: Vec<SpanTag>,
    pub file_path: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            tags: Vec::new(),
            file_path: PathBuf::from("/tmp/vm-api.log"),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var("LOG_LEVEL").unwrap_or(defaults.level),
            output: match env::var("LOG_OUTPUT").as_deref() {
                Ok("file") => LogOutput::File,
                Ok("both") => LogOutput::Both,
                _ => defaults.output,
            },
            format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => defaults.format,
            },
            tags: env::var("LOG_TAGS")
                .map(|raw| parse_tags(&raw))
                .unwrap_or_default(),
            file_path: env::var("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        QUIET_TARGETS.iter().fold(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level)),
            |filter, directive| match directive.parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => filter,
            },
        )
    }

    fn file_appender(&self) -> tracing_appender::rolling::RollingFileAppender {
        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = self
            .file_path
            .file_name()
            .unwrap_or_else(|| "vm-api.log".as_ref());
        tracing_appender::rolling::daily(dir, name)
    }
}

/// Parse `LOG_TAGS`, e.g. `vm_id:42,run_id:*`. Malformed entries are ignored.
pub fn parse_tags(raw: &str) -> Vec<SpanTag> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once(':')?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(SpanTag {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

/// Writes every record to two writers, e.g. stdout and the log file.
struct Tee<A, B>(A, B);

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let first = self.0.write(buf);
        let second = self.1.write(buf);
        first.or(second)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.1.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B>(A, B);

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee(self.0.make_writer(), self.1.make_writer())
    }
}

type SpanFields = HashMap<String, String>;

/// Drops events unless the enclosing spans carry every configured tag.
struct SpanTagFilter {
    tags: Vec<SpanTag>,
}

impl<S> Layer<S> for SpanTagFilter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = SpanFields::new();
        attrs.record(&mut FieldCollector(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(fields) = extensions.get_mut::<SpanFields>() {
            values.record(&mut FieldCollector(fields));
        }
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.tags.is_empty() {
            return true;
        }

        // With tags configured, events outside any span are dropped.
        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut fields = SpanFields::new();
        for span in scope {
            if let Some(span_fields) = span.extensions().get::<SpanFields>() {
                for (k, v) in span_fields {
                    fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.tags.iter().all(|tag| tag.matches(&fields))
    }
}

struct FieldCollector<'a>(&'a mut SpanFields);

impl Visit for FieldCollector<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Install the global subscriber from `LOG_*` environment variables.
///
/// Keep the returned guard alive for the life of the process when logging to
/// a file, or buffered lines are lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let subscriber = registry()
        .with(settings.env_filter())
        .with(SpanTagFilter {
            tags: settings.tags.clone(),
        });
    let json = settings.format == LogFormat::Json;

    macro_rules! install {
        ($writer:expr) => {{
            let layer = tracing_subscriber::fmt::layer().with_writer($writer);
            if json {
                subscriber.with(layer.json()).init();
            } else {
                subscriber.with(layer.pretty()).init();
            }
        }};
    }

    match settings.output {
        LogOutput::Console => {
            install!(io::stdout);
            None
        }
        LogOutput::File => {
            let (writer, guard) = tracing_appender::non_blocking(settings.file_appender());
            install!(writer);
            Some(guard)
        }
        LogOutput::Both => {
            let (writer, guard) = tracing_appender::non_blocking(settings.file_appender());
            install!(MakeTee(io::stdout, writer));
            Some(guard)
        }
    }
}
