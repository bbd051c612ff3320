//! Progress display while a plan is applied

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use resgraph::{ApplyObserver, ApplyOutcome, NodeResult, Step};

/// Progress bar over all steps of a plan
///
/// Failures are printed as they happen; the remaining outcomes are left to
/// the summary unless `verbose` is set.
pub struct ProgressObserver {
    pb: ProgressBar,
    verbose: bool,
}

impl ProgressObserver {
    pub fn new(total: usize, quiet: bool, verbose: bool) -> Self {
        let pb = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(total as u64)
        };
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        pb.set_style(style);
        Self { pb, verbose }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl ApplyObserver for ProgressObserver {
    fn on_batch_start(&mut self, index: usize, steps: &[Step]) {
        self.pb
            .set_message(format!("batch {} ({} resources)", index + 1, steps.len()));
    }

    fn on_node_complete(&mut self, result: &NodeResult) {
        match &result.outcome {
            ApplyOutcome::Failed { error } => self.pb.suspend(|| {
                println!("  {} {} ({})", "✗".red(), result.id, error);
            }),
            ApplyOutcome::Skipped { reason } if self.verbose => self.pb.suspend(|| {
                println!("  {} {} ({})", "-".dimmed(), result.id, reason.dimmed());
            }),
            outcome if self.verbose && outcome.is_change() => self.pb.suspend(|| {
                println!("  {} {} {}", "✓".green(), result.id, outcome.to_string().dimmed());
            }),
            _ => {}
        }
        self.pb.inc(1);
    }

    fn on_batch_complete(&mut self, index: usize) {
        log::debug!("Batch {} complete", index + 1);
    }
}
