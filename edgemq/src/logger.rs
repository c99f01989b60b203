use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use slog::{b, o, Drain};

use edgemq_conf::{Log, To};

use crate::Result;

pub use slog::Logger;

/// Routes the `log` facade into a slog logger built from `cfg`.
pub fn logger_init(cfg: &Log) -> Result<Logger> {
    if cfg.to.file() && !cfg.dir.as_os_str().is_empty() {
        std::fs::create_dir_all(&cfg.dir)
            .map_err(|e| anyhow!("log dir {} not usable, {}", cfg.dir.display(), e))?;
    }
    let level = cfg.level.inner();
    let logger = config_logger(cfg.path(), cfg.to, level);
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone()))).map_err(|e| anyhow!("logger init failed, {}", e))?;
    log::set_max_level(slog_log_to_level(level).to_level_filter());
    Ok(logger)
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

pub fn config_logger(path: Option<PathBuf>, to: To, level: slog::Level) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(path, to));
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn io::Write| {
            write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .build()
        .fuse();

    let drain = LevelFilter { drain, level }.ignore_res();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Logger::root(drain, o!())
}

struct LevelFilter<D> {
    drain: D,
    level: slog::Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &slog::Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level) {
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
            let path = self
                .path
                .as_deref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no log file configured"))?;
            self.file = Some(open_file(path)?);
        }
        self.file.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "log file not open"))
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.to {
            To::Console => self.console.write_all(buf)?,
            To::File => self.file()?.write_all(buf)?,
            To::Both => {
                self.console.write_all(buf)?;
                self.file()?.write_all(buf)?;
            }
            To::Off => {}
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.to {
            To::Console => self.console.flush()?,
            To::File => self.file()?.flush()?,
            To::Both => {
                self.console.flush()?;
                self.file()?.flush()?;
            }
            To::Off => {}
        };
        Ok(())
    }
}

fn open_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
