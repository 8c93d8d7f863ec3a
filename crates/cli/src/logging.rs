use anyhow::Context;
use locsim_engine::config::LoggingConfig;
use regex::Regex;
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Rewrites every configured pattern before the bytes reach stderr.
struct RedactingWriter<W> {
    inner: W,
    patterns: Vec<(Regex, String)>,
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut line = String::from_utf8_lossy(buf).into_owned();
        for (re, placeholder) in &self.patterns {
            line = re.replace_all(&line, placeholder.as_str()).into_owned();
        }
        self.inner.write_all(line.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter {
    patterns: Vec<(Regex, String)>,
}

impl<'a> fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
            patterns: self.patterns.clone(),
        }
    }
}

fn compile_patterns(config: &LoggingConfig) -> anyhow::Result<Vec<(Regex, String)>> {
    if !config.redaction.enabled {
        return Ok(Vec::new());
    }
    config
        .redaction
        .patterns
        .iter()
        .map(|p| {
            let re = Regex::new(&p.regex)
                .with_context(|| format!("invalid redaction pattern '{}'", p.name))?;
            Ok((re, p.placeholder.clone()))
        })
        .collect()
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;
    let writer = RedactingMakeWriter {
        patterns: compile_patterns(config)?,
    };

    let base = fmt::layer()
        .with_writer(writer)
        .with_target(config.show_target)
        .with_thread_ids(false);

    // Box each branch so the four combinations share one type.
    let layer = match (config.json, config.show_time) {
        (true, true) => base.json().boxed(),
        (true, false) => base.json().without_time().boxed(),
        (false, true) => base.boxed(),
        (false, false) => base.without_time().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;
    Ok(())
}
