//! Log setup
//!
//! Short-lived commands log to stderr. The scheduler daemon also writes
//! every line to `<dir>/runner_YYYYMMDD.log`, switching files when the local
//! date changes.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDate};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// stderr only, `RUST_LOG` or `default_level`
pub fn init_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(io::stderr)
        .init();
}

/// stderr plus a daily file under `dir`
pub fn init_daemon(dir: &Path) -> io::Result<DailyFileWriter> {
    let writer = DailyFileWriter::new(dir, "runner")?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_ansi(false)
        .with_writer(writer.clone())
        .init();
    Ok(writer)
}

struct DailyFile {
    date: NaiveDate,
    file: File,
}

/// `MakeWriter` that appends to a per-day file and echoes to stderr
#[derive(Clone)]
pub struct DailyFileWriter {
    dir: PathBuf,
    prefix: String,
    current: Arc<Mutex<DailyFile>>,
    echo_stderr: bool,
}

impl DailyFileWriter {
    pub fn new(dir: &Path, prefix: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let date = Local::now().date_naive();
        let file = open_for(dir, prefix, date)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            current: Arc::new(Mutex::new(DailyFile { date, file })),
            echo_stderr: true,
        })
    }

    pub fn without_stderr(mut self) -> Self {
        self.echo_stderr = false;
        self
    }

    /// File for `date`
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        file_path(&self.dir, &self.prefix, date)
    }

    /// File currently written to
    pub fn current_path(&self) -> PathBuf {
        let date = self
            .current
            .lock()
            .map(|c| c.date)
            .unwrap_or_else(|_| Local::now().date_naive());
        self.path_for(date)
    }

    fn write_line(&self, buf: &[u8]) -> io::Result<()> {
        let today = Local::now().date_naive();
        let mut current = self
            .current
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?;
        if current.date != today {
            current.file = open_for(&self.dir, &self.prefix, today)?;
            current.date = today;
        }
        current.file.write_all(buf)
    }
}

fn file_path(dir: &Path, prefix: &str, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}_{}.log", prefix, date.format("%Y%m%d")))
}

fn open_for(dir: &Path, prefix: &str, date: NaiveDate) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path(dir, prefix, date))
}

impl<'a> MakeWriter<'a> for DailyFileWriter {
    type Writer = DailyLineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DailyLineWriter { target: self.clone() }
    }
}

pub struct DailyLineWriter {
    target: DailyFileWriter,
}

impl Write for DailyLineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A broken log file must not take the daemon down; stderr still works.
        if let Err(e) = self.target.write_line(buf) {
            let _ = writeln!(io::stderr(), "log file write failed: {}", e);
        }
        if self.target.echo_stderr {
            io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.target.echo_stderr {
            io::stderr().flush()?;
        }
        Ok(())
    }
}
