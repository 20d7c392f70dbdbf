//! Telemetry data model — context mappings, records, and the envelope.
//!
//! This module defines the unit of work that flows through the pipeline:
//!
//! - [`Ctx`] — an insertion-ordered key/value mapping of ambient metadata.
//! - [`Level`] — log severity.
//! - [`LogRecord`] / [`EventRecord`] / [`Record`] — the payload variants.
//! - [`Envelope`] — a timestamp, a context snapshot, and a record.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An insertion-ordered mapping of context keys to opaque JSON values.
///
/// Merging is last-writer-wins per key. Overwriting an existing key keeps
/// the key's original position, so the order of a merged context reflects
/// the order keys were *first* introduced — matching the layering contract
/// where later sources override earlier ones without reordering them.
///
/// # Examples
///
/// ```
/// use beacon::envelope::Ctx;
/// use serde_json::json;
///
/// let mut ctx = Ctx::new();
/// ctx.set("app", json!("checkout"));
/// ctx.set("region", json!("eu-west-1"));
///
/// let mut overlay = Ctx::new();
/// overlay.set("region", json!("us-east-1"));
///
/// ctx.merge_from(&overlay);
/// assert_eq!(ctx.get("region"), Some(&json!("us-east-1")));
/// assert_eq!(ctx.keys().collect::<Vec<_>>(), vec!["app", "region"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ctx(IndexMap<String, Value>);

impl Ctx {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, for constructing literal contexts inline.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Inserts or overwrites a key. An overwritten key keeps its position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value for `key`, or `None`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Removes a key, shifting later entries down. Returns the removed value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// Merges `other` into `self`, last-writer-wins per key.
    pub fn merge_from(&mut self, other: &Ctx) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Consuming variant of [`merge_from`](Self::merge_from) for chained layering.
    #[must_use]
    pub fn merged(mut self, other: &Ctx) -> Self {
        self.merge_from(other);
        self
    }

    /// Returns `true` if the context has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates over keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns the context as a JSON object value.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Ctx {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Log severity, lowest to highest.
///
/// # Examples
///
/// ```
/// use beacon::envelope::Level;
///
/// let level: Level = "warn".parse().unwrap();
/// assert_eq!(level, Level::Warn);
/// assert_eq!(level.as_str(), "warn");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Returns the level as its lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// All levels, lowest to highest.
    pub const ALL: [Level; 4] = [Level::Debug, Level::Info, Level::Warn, Level::Error];
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            other => return Err(UnknownLevel(other.to_owned())),
        })
    }
}

/// Error returned when parsing an unrecognized level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level: {0:?}")]
pub struct UnknownLevel(pub String);

/// A structured log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Severity of this line.
    pub level: Level,
    /// Human-readable message.
    pub msg: String,
    /// Optional structured payload, conventionally a JSON object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Optional captured error, conventionally built via
    /// [`error_value`](crate::util::json::error_value).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
}

impl LogRecord {
    /// Creates a record with no payload and no error.
    pub fn new(level: Level, msg: impl Into<String>) -> Self {
        Self {
            level,
            msg: msg.into(),
            data: None,
            err: None,
        }
    }

    /// Attaches a structured payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches a captured error value.
    #[must_use]
    pub fn with_err(mut self, err: Value) -> Self {
        self.err = Some(err);
        self
    }
}

/// A named product/diagnostic event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Event name, e.g. `"page_view"`.
    pub name: String,
    /// Optional event properties, conventionally a JSON object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub props: Option<Value>,
}

impl EventRecord {
    /// Creates an event with no properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            props: None,
        }
    }

    /// Attaches event properties.
    #[must_use]
    pub fn with_props(mut self, props: Value) -> Self {
        self.props = Some(props);
        self
    }
}

/// The payload of an envelope: a log line or an event.
///
/// Serializes with a `"kind"` tag (`"log"` / `"event"`) alongside the
/// variant's fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    /// A structured log line.
    Log(LogRecord),
    /// A named event.
    Event(EventRecord),
}

impl Record {
    /// Returns the wire kind tag for this record.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Event(_) => "event",
        }
    }

    /// Returns the level for log records, `None` for events.
    pub fn level(&self) -> Option<Level> {
        match self {
            Self::Log(log) => Some(log.level),
            Self::Event(_) => None,
        }
    }

    /// Returns the event name for event records, `None` for logs.
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Self::Log(_) => None,
            Self::Event(event) => Some(&event.name),
        }
    }
}

/// The unit of work flowing through the pipeline.
///
/// An envelope is created once per emit with a timestamp and a freshly
/// merged context snapshot, then handed through the middleware chain.
/// Middlewares may rewrite `ctx` and augment record fields; the timestamp
/// is fixed at creation and the record kind must not change.
///
/// # Examples
///
/// ```
/// use beacon::envelope::{Ctx, Envelope, Level, LogRecord, Record};
///
/// let env = Envelope::new(
///     1_700_000_000_000,
///     Ctx::new().with("app", "checkout"),
///     Record::Log(LogRecord::new(Level::Info, "started")),
/// );
/// assert_eq!(env.ts(), 1_700_000_000_000);
/// assert_eq!(env.record.kind(), "log");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    ts: u64,
    /// Context snapshot taken at emit time. Middleware mutations stay local
    /// to this envelope.
    pub ctx: Ctx,
    /// The log or event payload.
    pub record: Record,
}

impl Envelope {
    /// Creates an envelope. `ts` is fixed for the envelope's lifetime.
    pub fn new(ts: u64, ctx: Ctx, record: Record) -> Self {
        Self { ts, ctx, record }
    }

    /// Creation timestamp in milliseconds since the Unix epoch.
    pub fn ts(&self) -> u64 {
        self.ts
    }
}
