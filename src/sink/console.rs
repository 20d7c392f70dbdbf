//! Console sink — level-routed terminal output.
//!
//! Log records print one formatted line each: debug and info go to
//! stdout, warn and error to stderr. Event records serialize the whole
//! envelope as JSON on a single stdout line. Write failures are ignored;
//! this sink never returns an error.

use std::future::Future;
use std::io::Write;
use std::pin::Pin;

use super::Sink;
use crate::envelope::{Envelope, Level, Record};
use crate::error::SinkError;

/// Terminal sink for local development and interactive sessions.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use beacon::sink::console::ConsoleSink;
///
/// let sink = Arc::new(ConsoleSink::new());
/// ```
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    /// Creates a console sink.
    pub fn new() -> Self {
        Self
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn deliver(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send>> {
        Box::pin(async move {
            let line = format_line(&envelope);
            if routes_to_stderr(&envelope.record) {
                let _ = writeln!(std::io::stderr().lock(), "{line}");
            } else {
                let _ = writeln!(std::io::stdout().lock(), "{line}");
            }
            Ok(())
        })
    }
}

/// Warn and error logs go to stderr; everything else to stdout.
fn routes_to_stderr(record: &Record) -> bool {
    matches!(
        record,
        Record::Log(log) if matches!(log.level, Level::Warn | Level::Error)
    )
}

fn format_line(envelope: &Envelope) -> String {
    match &envelope.record {
        Record::Log(log) => {
            let mut line = format!("[{}] {}", log.level, log.msg);
            if let Some(data) = &log.data {
                line.push_str(" data=");
                line.push_str(&serde_json::to_string(data).unwrap_or_default());
            }
            if let Some(err) = &log.err {
                line.push_str(" err=");
                line.push_str(&serde_json::to_string(err).unwrap_or_default());
            }
            if !envelope.ctx.is_empty() {
                line.push_str(" ctx=");
                line.push_str(&serde_json::to_string(&envelope.ctx).unwrap_or_default());
            }
            line
        }
        // Events carry arbitrary shape; print the whole envelope as JSON.
        Record::Event(_) => serde_json::to_string(envelope).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Ctx, EventRecord, LogRecord};
    use serde_json::json;

    #[test]
    fn log_line_includes_level_message_and_payloads() {
        let envelope = Envelope::new(
            1,
            Ctx::new().with("app", "test"),
            Record::Log(
                LogRecord::new(Level::Warn, "disk low")
                    .with_data(json!({"free_mb": 12}))
                    .with_err(json!({"message": "ENOSPC"})),
            ),
        );
        let line = format_line(&envelope);
        assert!(line.starts_with("[warn] disk low"));
        assert!(line.contains(r#"data={"free_mb":12}"#));
        assert!(line.contains(r#"err={"message":"ENOSPC"}"#));
        assert!(line.contains(r#"ctx={"app":"test"}"#));
    }

    #[test]
    fn plain_log_line_has_no_trailing_sections() {
        let envelope = Envelope::new(1, Ctx::new(), Record::Log(LogRecord::new(Level::Info, "hi")));
        assert_eq!(format_line(&envelope), "[info] hi");
    }

    #[test]
    fn event_line_is_the_whole_envelope_as_json() {
        let envelope = Envelope::new(
            5,
            Ctx::new().with("app", "test"),
            Record::Event(EventRecord::new("click").with_props(json!({"x": 1}))),
        );
        let line = format_line(&envelope);
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["ts"], 5);
        assert_eq!(parsed["ctx"]["app"], "test");
        assert_eq!(parsed["record"]["kind"], "event");
        assert_eq!(parsed["record"]["props"]["x"], 1);
    }

    #[test]
    fn warn_and_error_route_to_stderr() {
        let log = |level| Record::Log(LogRecord::new(level, "m"));
        assert!(!routes_to_stderr(&log(Level::Debug)));
        assert!(!routes_to_stderr(&log(Level::Info)));
        assert!(routes_to_stderr(&log(Level::Warn)));
        assert!(routes_to_stderr(&log(Level::Error)));
        assert!(!routes_to_stderr(&Record::Event(EventRecord::new("e"))));
    }
}
