//! Per-job logger: dual dispatch to a job log file and an optional host
//! callback, with section markers, step-boundary progress filtering, and a
//! bounded tail buffer for compact-on-error reporting (C1's error_tail).

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Local;
use log::Level;

pub type LogCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

struct Inner {
    file: Option<BufWriter<File>>,
    callback: Option<LogCallback>,
    tail: VecDeque<String>,
    tail_capacity: usize,
    last_progress_step: u32,
    progress_step: u32,
}

/// Cloneable handle; all clones share the same file/tail/callback state.
#[derive(Clone)]
pub struct JobLogger {
    inner: Arc<Mutex<Inner>>,
}

impl JobLogger {
    /// `log_path`: e.g. `<working_dir>/job.log`. `tail_capacity`: how many
    /// trailing output lines to retain for error reporting (spec default 20).
    pub fn new(log_path: &Path, tail_capacity: usize, progress_step: u32) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(log_path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                file: Some(BufWriter::new(file)),
                callback: None,
                tail: VecDeque::with_capacity(tail_capacity),
                tail_capacity,
                last_progress_step: u32::MAX,
                progress_step,
            })),
        })
    }

    pub fn with_callback(self, callback: LogCallback) -> Self {
        self.inner.lock().unwrap().callback = Some(callback);
        self
    }

    fn write_line(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(w) = inner.file.as_mut() {
            let _ = writeln!(w, "{line}");
            let _ = w.flush();
        }
        if let Some(cb) = inner.callback.as_ref() {
            cb(line);
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        let ts = Local::now().format("%H:%M:%S");
        let line = format!("[{ts}] [{}] {message}", level.as_str());
        self.write_line(&line);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
        log::log!(Level::Debug, "{message}");
    }
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
        log::log!(Level::Info, "{message}");
    }
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warning, message);
        log::log!(Level::Warn, "{message}");
    }
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
        log::log!(Level::Error, "{message}");
    }
    pub fn fatal(&self, message: &str) {
        self.log(LogLevel::Fatal, message);
        log::log!(Level::Error, "[FATAL] {message}");
    }

    pub fn section(&self, name: &str) {
        self.write_line(&format!("--- {name} ---"));
    }

    /// Record a line of subprocess output into the tail buffer (always),
    /// and echo it through the sink (unless suppressed by caller).
    pub fn output_line(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.tail.len() == inner.tail_capacity {
            inner.tail.pop_front();
        }
        inner.tail.push_back(line.to_string());
        drop(inner);
        self.write_line(line);
    }

    /// Forward progress only when the percent crosses a configured step
    /// (e.g. every 20%); returns whether it was forwarded.
    pub fn progress(&self, percent: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let step = inner.progress_step.max(1);
        let bucket = percent / step;
        let last_bucket = if inner.last_progress_step == u32::MAX {
            u32::MAX
        } else {
            inner.last_progress_step / step
        };
        if bucket != last_bucket {
            inner.last_progress_step = percent;
            drop(inner);
            self.write_line(&format!("Progress: {percent}%"));
            true
        } else {
            false
        }
    }

    /// Last N lines of captured subprocess output, for `ToolExit` reporting.
    pub fn tail(&self) -> Vec<String> {
        self.inner.lock().unwrap().tail.iter().cloned().collect()
    }

    pub fn clear_tail(&self) {
        self.inner.lock().unwrap().tail.clear();
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(w) = inner.file.as_mut() {
            let _ = w.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_log_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("audiosync_test_{name}_{}.log", std::process::id()))
    }

    #[test]
    fn writes_formatted_line_to_file() {
        let path = temp_log_path("writes");
        let logger = JobLogger::new(&path, 20, 20).unwrap();
        logger.info("hello");
        logger.flush();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[INFO] hello"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn section_marker_format() {
        let path = temp_log_path("section");
        let logger = JobLogger::new(&path, 20, 20).unwrap();
        logger.section("Analyze");
        logger.flush();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("--- Analyze ---"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn tail_buffer_is_bounded() {
        let path = temp_log_path("tail");
        let logger = JobLogger::new(&path, 3, 20).unwrap();
        for i in 0..5 {
            logger.output_line(&format!("line {i}"));
        }
        let tail = logger.tail();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0], "line 2");
        assert_eq!(tail[2], "line 4");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn progress_forwards_only_on_step_crossing() {
        let path = temp_log_path("progress");
        let logger = JobLogger::new(&path, 20, 20).unwrap();
        assert!(logger.progress(5));
        assert!(!logger.progress(10));
        assert!(logger.progress(21));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn callback_receives_lines() {
        let path = temp_log_path("callback");
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let logger = JobLogger::new(&path, 20, 20).unwrap()
            .with_callback(Box::new(move |_| { count2.fetch_add(1, Ordering::SeqCst); }));
        logger.info("a");
        logger.warn("b");
        assert_eq!(count.load(Ordering::SeqCst), 2);
        let _ = std::fs::remove_file(&path);
    }
}
