use std::fs::{File, OpenOptions};
use std::io::{self, Stdout};
use std::path::{Path, PathBuf};

use parking_lot::{const_mutex, Mutex};
use slog::{b, o, Drain, Record};
use slog_async::AsyncGuard;

use ebus_conf::logging::{Level, Log, To};

use crate::{BusError, Result};

pub use slog::Logger;

static GUARD: Mutex<Option<AsyncGuard>> = const_mutex(None);

/// Installs the `log` facade backend described by `cfg`. Can only succeed once
/// per process.
pub fn logger_init(cfg: &Log) -> Result<()> {
    let logger = config_logger(cfg.path(), cfg.destination(), cfg.level);
    log::set_boxed_logger(Box::new(LoggerEx(logger)))
        .map_err(|e| BusError::msg(format!("logger init error, {e}")))?;
    log::set_max_level(slog_log_to_level(cfg.level.inner()).to_level_filter());
    Ok(())
}

/// Drains pending records and stops the logging thread. Records logged
/// afterwards are discarded.
pub fn flush() {
    drop(GUARD.lock().take());
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

fn timestamp(io: &mut dyn io::Write) -> io::Result<()> {
    write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

pub fn config_logger(path: Option<PathBuf>, to: To, level: Level) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(path, to));
    let drain = slog_term::FullFormat::new(decorator).use_custom_timestamp(timestamp).build().fuse();

    let drain = LevelFilter { drain, level }.fuse();

    let (drain, guard) = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build_with_guard();
    *GUARD.lock() = Some(guard);

    Logger::root(drain.ignore_res(), o!())
}

struct LevelFilter<D> {
    drain: D,
    level: Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level.inner()) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

struct WriteFilter {
    path: Option<PathBuf>,
    to: To,

    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(path: Option<PathBuf>, to: To) -> Self {
        Self { path, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let path = self.path.as_deref().ok_or_else(|| io::Error::other("no log file configured"))?;
            self.file = Some(open_file(path)?);
        }
        self.file.as_mut().ok_or_else(|| io::Error::other("log file unavailable"))
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.to {
            To::Console => io::Write::write(&mut self.console, buf)?,
            To::File => io::Write::write(self.file()?, buf)?,
            To::Both => {
                let _ = io::Write::write(&mut self.console, buf)?;
                io::Write::write(self.file()?, buf)?
            }
            To::Off => buf.len(),
        };
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.to {
            To::Console => io::Write::flush(&mut self.console)?,
            To::File => io::Write::flush(self.file()?)?,
            To::Both => {
                io::Write::flush(&mut self.console)?;
                io::Write::flush(self.file()?)?;
            }
            To::Off => {}
        };
        Ok(())
    }
}

fn open_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).map_err(|e| {
        io::Error::new(e.kind(), format!("logger file config error, filename: {}, {e}", path.display()))
    })
}
