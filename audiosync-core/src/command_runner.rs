//! C1 — Command Runner.
//!
//! The single place in this crate that spawns external processes. Streams
//! both standard streams line-by-line through the job logger, recognizes
//! `Progress: <N>%` lines and forwards them on step crossings only, and on
//! non-zero exit captures the last `error_tail` lines for diagnosis.
//!
//! Grounded on the teacher's ffmpeg invocation in `audio_io.rs`, which
//! already filters stderr down to a meaningful tail on failure.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::logging::JobLogger;
use crate::models::CancelToken;

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub tail: Vec<String>,
}

/// Runs `cmd args...`, streaming output through `logger`. Blocking; safe to
/// call from any worker thread. Checks `cancel` before spawn and polls it
/// while waiting on the child.
pub fn run(
    cmd: &str,
    args: &[&str],
    logger: &JobLogger,
    cancel: &CancelToken,
    timeout: Option<Duration>,
) -> Result<CommandOutcome, PipelineError> {
    run_inner(cmd, args, logger, cancel, timeout, false).map(|(outcome, _)| outcome)
}

/// Like [`run`], but also returns the full captured stdout text — for tools
/// whose stdout is structured data to parse (e.g. a JSON probe) rather than
/// a human-readable progress/log stream. stdout lines are still recorded in
/// the logger's tail buffer and echoed, exactly as in [`run`].
pub fn run_capturing_stdout(
    cmd: &str,
    args: &[&str],
    logger: &JobLogger,
    cancel: &CancelToken,
    timeout: Option<Duration>,
) -> Result<(CommandOutcome, String), PipelineError> {
    run_inner(cmd, args, logger, cancel, timeout, true)
}

fn run_inner(
    cmd: &str,
    args: &[&str],
    logger: &JobLogger,
    cancel: &CancelToken,
    timeout: Option<Duration>,
    capture_stdout: bool,
) -> Result<(CommandOutcome, String), PipelineError> {
    crate::models::check_cancelled(cancel)?;

    let mut child = Command::new(cmd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|_| PipelineError::ToolMissing(cmd.to_string()))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    #[derive(Debug)]
    enum Line {
        Out(String),
        Err(String),
    }

    let (tx, rx) = mpsc::channel::<Line>();
    let tx_err = tx.clone();

    let out_handle = std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            let _ = tx.send(Line::Out(line));
        }
    });
    let err_handle = std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            let _ = tx_err.send(Line::Err(line));
        }
    });

    logger.clear_tail();
    let mut stdout_buf = String::new();
    for line in rx.iter() {
        let line = match line {
            Line::Out(l) => {
                if capture_stdout {
                    stdout_buf.push_str(&l);
                    stdout_buf.push('\n');
                }
                l
            }
            Line::Err(l) => l,
        };
        if let Some(rest) = line.strip_prefix("Progress: ") {
            if let Ok(pct) = rest.trim_end_matches('%').parse::<u32>() {
                logger.progress(pct);
                continue;
            }
        }
        logger.output_line(&line);
    }

    let _ = out_handle.join();
    let _ = err_handle.join();

    let status = wait_with_cancel(&mut child, cancel, timeout)?;

    let tail = logger.tail();
    let exit_code = status.code().unwrap_or(-1);
    if exit_code != 0 {
        return Err(PipelineError::ToolExit { code: exit_code, tail });
    }
    Ok((CommandOutcome { exit_code, tail }, stdout_buf))
}

fn wait_with_cancel(
    child: &mut std::process::Child,
    cancel: &CancelToken,
    timeout: Option<Duration>,
) -> Result<std::process::ExitStatus, PipelineError> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(|e| PipelineError::ToolExit { code: -1, tail: vec![e.to_string()] })? {
            return Ok(status);
        }
        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineError::Cancelled);
        }
        if let Some(t) = timeout {
            if start.elapsed() > t {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PipelineError::ToolTimeout { seconds: t.as_secs() });
            }
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::new_cancel_token;

    fn test_logger(name: &str) -> JobLogger {
        let path = std::env::temp_dir().join(format!("audiosync_cr_{name}_{}.log", std::process::id()));
        JobLogger::new(&path, 20, 20).unwrap()
    }

    #[test]
    fn missing_tool_reports_tool_missing() {
        let logger = test_logger("missing");
        let cancel = new_cancel_token();
        let result = run("definitely-not-a-real-binary-xyz", &[], &logger, &cancel, None);
        assert!(matches!(result, Err(PipelineError::ToolMissing(_))));
    }

    #[test]
    fn successful_command_reports_zero_exit() {
        let logger = test_logger("success");
        let cancel = new_cancel_token();
        let result = run("true", &[], &logger, &cancel, None);
        assert!(result.is_ok());
        assert_eq!(result.unwrap().exit_code, 0);
    }

    #[test]
    fn failing_command_captures_tail() {
        let logger = test_logger("fail");
        let cancel = new_cancel_token();
        let result = run("sh", &["-c", "echo boom 1>&2; exit 3"], &logger, &cancel, None);
        match result {
            Err(PipelineError::ToolExit { code, tail }) => {
                assert_eq!(code, 3);
                assert!(tail.iter().any(|l| l.contains("boom")));
            }
            other => panic!("expected ToolExit, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_before_spawn_short_circuits() {
        let logger = test_logger("cancel");
        let cancel = new_cancel_token();
        cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        let result = run("true", &[], &logger, &cancel, None);
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
