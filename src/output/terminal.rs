// Terminal rendering for batch runs

use std::io::IsTerminal;
use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};

use crate::store::{BatchStatus, ExecutionDetails, ExecutionSummary, HostExecutionResult, HostStatus};

/// Terminal output manager
pub struct TerminalOutput {
    verbose: bool,
    quiet: bool,
    is_tty: bool,
}

impl TerminalOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        let is_tty = std::io::stdout().is_terminal();

        // Respect NO_COLOR (https://no-color.org/) and plain pipes
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        TerminalOutput {
            verbose,
            quiet,
            is_tty,
        }
    }

    /// Print the header for a batch
    pub fn print_batch_header(&self, command: &str, hosts_count: usize) {
        if self.quiet {
            return;
        }

        println!();
        println!(
            "{} {} ({} hosts)",
            "RUN".green().bold(),
            command.cyan(),
            hosts_count
        );
        println!("{}", "─".repeat(60).dimmed());
    }

    /// Progress bar counting finished hosts
    pub fn create_progress(&self, total: u64) -> ProgressBar {
        if self.quiet || !self.is_tty {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("█▓░").tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Print one host's final row
    pub fn print_host_result(&self, result: &HostExecutionResult) {
        let failed = result.status.is_failure();
        if self.quiet && !failed {
            return;
        }

        let mut line = format!(
            "  {} {} {}",
            host_status_label(result.status),
            "=>".dimmed(),
            result.host_name.white().bold()
        );
        if let Some(code) = result.exit_code {
            line.push_str(&format!(" {}", format!("rc={}", code).dimmed()));
        }
        if result.attempts > 1 {
            line.push_str(&format!(" {}", format!("attempts={}", result.attempts).dimmed()));
        }
        println!("{}", line);

        if self.verbose || failed {
            for l in result.stdout.lines() {
                println!("      {}", l.dimmed());
            }
            for l in result.stderr.lines() {
                println!("      {}", l.red());
            }
            if let Some(error) = &result.error {
                println!("      {}", error.red());
            }
        }
    }

    /// Print every host row followed by the recap
    pub fn print_details(&self, details: &ExecutionDetails) {
        for host in &details.hosts {
            self.print_host_result(host);
        }
        self.print_summary(details);
    }

    pub fn print_summary(&self, details: &ExecutionDetails) {
        let execution = &details.execution;
        let summary = details.summary();

        println!();
        println!("{}", "RECAP".green().bold());
        println!("{}", "─".repeat(60).dimmed());
        println!(
            "{:<12} : {}",
            "status",
            batch_status_label(execution.status)
        );
        println!("{:<12} : {}", "hosts", summary_counts(&summary));
        println!(
            "{:<12} : {:.0}%",
            "success",
            summary.success_rate * 100.0
        );
        if let Some(avg) = summary.average_host_duration_ms {
            println!("{:<12} : {}", "avg/host", format_millis(avg as i64));
        }
        if let Some(ms) = execution.duration_ms {
            println!();
            println!("Total time: {}", format_millis(ms));
        }
        if let Some(error) = &execution.error {
            println!("{} {}", "error:".red().bold(), error);
        }
    }
}

impl Default for TerminalOutput {
    fn default() -> Self {
        Self::new(false, false)
    }
}

pub fn host_status_label(status: HostStatus) -> ColoredString {
    let text = status.as_str().to_uppercase();
    match status {
        HostStatus::Completed => text.green(),
        HostStatus::Failed => text.red().bold(),
        HostStatus::Timeout => text.magenta().bold(),
        HostStatus::Cancelled => text.yellow(),
        HostStatus::Pending | HostStatus::Running => text.cyan(),
    }
}

pub fn batch_status_label(status: BatchStatus) -> ColoredString {
    let text = status.as_str().to_uppercase();
    match status {
        BatchStatus::Completed => text.green().bold(),
        BatchStatus::Failed => text.red().bold(),
        BatchStatus::Cancelled => text.yellow().bold(),
        BatchStatus::Pending | BatchStatus::Running => text.cyan(),
    }
}

/// `ok=2 failed=1 timeout=0 cancelled=0`, zero counts uncolored
fn summary_counts(summary: &ExecutionSummary) -> String {
    let count = |label: &str, n: usize, color: Color| {
        let text = format!("{}={}", label, n);
        if n > 0 {
            text.color(color).to_string()
        } else {
            text
        }
    };

    [
        count("ok", summary.completed, Color::Green),
        count("failed", summary.failed, Color::Red),
        count("timeout", summary.timed_out, Color::Magenta),
        count("cancelled", summary.cancelled, Color::Yellow),
    ]
    .join("    ")
}

pub fn format_millis(ms: i64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.2}s", ms as f64 / 1000.0)
    }
}
