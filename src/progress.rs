use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Controls how progress is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners on a terminal.
    Normal,
    /// Spinners, with tracing output going to stderr as well.
    Verbose,
    /// No spinners, results only.
    Quiet,
    /// No ANSI: plain println output (for piped/non-TTY).
    Plain,
}

impl OutputMode {
    pub fn resolve(verbose: bool, quiet: bool, is_tty: bool) -> Self {
        if quiet {
            OutputMode::Quiet
        } else if !is_tty {
            OutputMode::Plain
        } else if verbose {
            OutputMode::Verbose
        } else {
            OutputMode::Normal
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("\u{2713} {msg:.green}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("\u{2717} {msg:.red}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Spinner around one awaited task.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    mode: OutputMode,
}

impl Progress {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Run `fut` behind a spinner labelled `label`.
    ///
    /// The spinner is finished with a checkmark on `Ok` and a cross on `Err`;
    /// the error itself is left to the caller to report.
    pub async fn run<Fut, T, E>(&self, label: &str, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let bar = match self.mode {
            OutputMode::Normal | OutputMode::Verbose => ProgressBar::new_spinner(),
            OutputMode::Quiet => ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden()),
            OutputMode::Plain => {
                println!("{label}...");
                ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
            }
        };
        bar.set_style(spinner_style());
        bar.set_message(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));

        let result = fut.await;

        match &result {
            Ok(_) => {
                bar.set_style(done_style());
                bar.finish_with_message(label.to_string());
            }
            Err(_) => {
                bar.set_style(failed_style());
                bar.finish_with_message(label.to_string());
            }
        }
        result
    }
}
