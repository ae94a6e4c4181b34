//! Log-line redaction (spec §7): scrubs field *values* whose field *name*
//! matches a glob-style pattern, before the line is formatted.

use std::fmt;

use tracing::field::{Field, Visit};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

const REDACTED: &str = "[REDACTED]";

/// Glob patterns (`*` and `?` only) matched against `tracing` field names.
/// Values of matching fields are replaced with `[REDACTED]` before any
/// formatting layer sees them.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    patterns: Vec<String>,
}

impl Redactor {
    #[must_use]
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    fn matches(&self, field_name: &str) -> bool {
        self.patterns.iter().any(|p| glob_match(p, field_name))
    }
}

/// Minimal glob matcher supporting `*` (any run of characters) and `?`
/// (exactly one character); sufficient for key-name patterns like
/// `*_key`, `*token*`, `password`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_inner(&p, &t)
}

fn glob_match_inner(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            glob_match_inner(&pattern[1..], text)
                || (!text.is_empty() && glob_match_inner(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && glob_match_inner(&pattern[1..], &text[1..]),
        Some(c) => text.first() == Some(c) && glob_match_inner(&pattern[1..], &text[1..]),
    }
}

/// A JSON `FormatEvent` that redacts matching field values before they're
/// ever written out, meant to be installed via
/// `tracing_subscriber::fmt().event_format(RedactingJsonFormatter::new(redactor))`.
/// Running the redaction inside the formatter (rather than as a separate
/// layer downstream of fmt) guarantees no unredacted copy of the line is
/// ever produced, per spec §7: "the redactor runs before serialization of
/// the log line."
#[derive(Debug, Clone, Default)]
pub struct RedactingJsonFormatter {
    redactor: Redactor,
}

impl RedactingJsonFormatter {
    #[must_use]
    pub fn new(redactor: Redactor) -> Self {
        Self { redactor }
    }
}

impl<S, N> FormatEvent<S, N> for RedactingJsonFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut visitor = JsonVisitor { redactor: &self.redactor, fields: serde_json::Map::new() };
        event.record(&mut visitor);

        let mut line = serde_json::Map::new();
        line.insert("level".into(), serde_json::Value::String(metadata.level().to_string()));
        line.insert("target".into(), serde_json::Value::String(metadata.target().to_string()));
        line.extend(visitor.fields);

        let rendered = serde_json::Value::Object(line).to_string();
        writeln!(writer, "{rendered}")
    }
}

struct JsonVisitor<'a> {
    redactor: &'a Redactor,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Visit for JsonVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = if self.redactor.matches(field.name()) {
            serde_json::Value::String(REDACTED.to_string())
        } else {
            serde_json::Value::String(format!("{value:?}"))
        };
        self.fields.insert(field.name().to_string(), rendered);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        let rendered = if self.redactor.matches(field.name()) {
            REDACTED.to_string()
        } else {
            value.to_string()
        };
        self.fields.insert(field.name().to_string(), serde_json::Value::String(rendered));
    }
}

/// Redacts any matching key's value inside a pre-serialized JSON log line.
/// The writer's own NDJSON output path is explicitly exempt -- spec
/// redaction only applies to log lines, never to data records.
#[must_use]
pub fn redact_json_line(redactor: &Redactor, mut value: serde_json::Value) -> serde_json::Value {
    if let serde_json::Value::Object(ref mut map) = value {
        for (key, val) in map.iter_mut() {
            if redactor.matches(key) && !val.is_null() {
                *val = serde_json::Value::String(REDACTED.to_string());
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_suffix_and_prefix() {
        assert!(glob_match("*_key", "api_key"));
        assert!(glob_match("*token*", "refresh_token_value"));
        assert!(!glob_match("*_key", "keyring"));
    }

    #[test]
    fn glob_question_mark_matches_one_char() {
        assert!(glob_match("pa?s", "pass"));
        assert!(!glob_match("pa?s", "paass"));
    }

    #[test]
    fn redact_json_line_replaces_matching_keys_only() {
        let redactor = Redactor::new(vec!["*_key".into(), "password".into()]);
        let line = serde_json::json!({ "api_key": "SECRET_XYZ", "device_id": "d1", "password": "hunter2" });
        let redacted = redact_json_line(&redactor, line);
        assert_eq!(redacted["api_key"], "[REDACTED]");
        assert_eq!(redacted["password"], "[REDACTED]");
        assert_eq!(redacted["device_id"], "d1");
    }

    #[test]
    fn redact_json_line_never_touches_non_matching_values() {
        let redactor = Redactor::new(vec!["nonexistent".into()]);
        let line = serde_json::json!({ "device_id": "SECRET_XYZ" });
        let redacted = redact_json_line(&redactor, line);
        assert_eq!(redacted["device_id"], "SECRET_XYZ");
    }

    #[test]
    fn formatted_event_never_contains_the_secret_substring() {
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::fmt::MakeWriter;

        #[derive(Clone)]
        struct BufWriter(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for BufWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        impl<'a> MakeWriter<'a> for BufWriter {
            type Writer = Self;
            fn make_writer(&'a self) -> Self::Writer {
                self.clone()
            }
        }

        let buf = Arc::new(Mutex::new(Vec::new()));
        let redactor = Redactor::new(vec!["api_key".into()]);
        let subscriber = tracing_subscriber::fmt()
            .event_format(RedactingJsonFormatter::new(redactor))
            .with_writer(BufWriter(buf.clone()))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(api_key = "SECRET_XYZ", "connecting");
        });

        let output = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert!(!output.contains("SECRET_XYZ"));
        assert!(output.contains("REDACTED"));
    }
}
