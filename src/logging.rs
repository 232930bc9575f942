// Tracing setup shared by the CLI and the status server

use tracing::Subscriber;
use tracing_subscriber::{fmt, fmt::MakeWriter, prelude::*, EnvFilter};

/// `RUST_LOG` filter (default `info`); `FXP_LOG_FORMAT=json` for JSON lines.
/// Both formats go to stderr so stdout stays clean for `--json` reports.
pub fn init_tracing() {
    let log_format = std::env::var("FXP_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    build_subscriber(&log_format, filter, std::io::stderr).init();
}

pub fn build_subscriber<W>(log_format: &str, filter: EnvFilter, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        Box::new(registry.with(fmt::layer().json().with_current_span(true).with_writer(writer)))
    } else {
        Box::new(registry.with(fmt::layer().with_target(true).with_writer(writer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_json_lines_go_to_the_given_writer() {
        let captured = Captured::default();
        let subscriber = build_subscriber("JSON", EnvFilter::new("info"), captured.clone());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(rows = 3, "feature dataset written");
            tracing::debug!("filtered out");
        });

        let out = captured.text();
        assert_eq!(out.lines().count(), 1);
        let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["fields"]["message"], "feature dataset written");
        assert_eq!(line["fields"]["rows"], 3);
    }

    #[test]
    fn test_text_format_uses_the_same_writer() {
        let captured = Captured::default();
        let subscriber = build_subscriber("text", EnvFilter::new("info"), captured.clone());

        tracing::subscriber::with_default(subscriber, || tracing::warn!("quality gate warning"));

        let out = captured.text();
        assert!(out.contains("quality gate warning"));
        assert!(serde_json::from_str::<serde_json::Value>(out.trim()).is_err());
    }
}
