use colored::{ColoredString, Colorize};
use resgraph::{Action, ApplyReport, Plan, Step};
use serde_json::Value;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Plans and Reports
// ============================================================================

fn action_symbol(action: Action) -> ColoredString {
    match action {
        Action::Create => "+".green(),
        Action::Update => "~".yellow(),
        Action::Delete => "-".red(),
        Action::Unchanged => " ".normal(),
    }
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => format!("{s:?}"),
        Some(other) => other.to_string(),
        None => "(none)".to_string(),
    }
}

fn print_step(step: &Step) {
    let mut line = format!("  {} {}", action_symbol(step.action), step.id);
    if step.action == Action::Update && !step.inputs_known {
        line.push_str(&format!(" {}", "(inputs known after apply)".dimmed()));
    }
    if step.action == Action::Delete && !step.dependents.is_empty() {
        line.push_str(&format!(
            " {}",
            format!("(after {})", step.dependents.join(", ")).dimmed()
        ));
    }
    println!("{line}");

    if step.action == Action::Update {
        for change in &step.changes {
            println!(
                "      {}: {} → {}",
                change.attribute,
                render_value(change.before.as_ref()).red(),
                render_value(change.after.as_ref()).green()
            );
        }
    }
}

/// Print a plan batch by batch
///
/// Unchanged resources are listed only when `verbose` is set.
pub fn plan(plan: &Plan, verbose: bool) {
    for (index, batch) in plan.batches().iter().enumerate() {
        let shown: Vec<&Step> = batch
            .iter()
            .filter(|step| verbose || step.action.is_change())
            .collect();
        if shown.is_empty() {
            continue;
        }
        println!();
        println!("{}", format!("Batch {}", index + 1).cyan().bold());
        for step in shown {
            print_step(step);
        }
    }

    let summary = plan.summary();
    println!();
    println!(
        "{} {} to create, {} to update, {} to delete, {} unchanged",
        "Plan:".bold(),
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.delete.to_string().red(),
        summary.unchanged
    );
}

/// Print the outcome of an apply
pub fn report(report: &ApplyReport) {
    let summary = report.summary();

    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        header("Failures");
        for result in failures {
            println!("  {} {} ({})", "✗".red(), result.id, result.outcome);
        }
    }

    println!();
    let line = format!(
        "{} created, {} updated, {} deleted, {} unchanged",
        summary.created, summary.updated, summary.deleted, summary.unchanged
    );
    if summary.is_success() {
        success(&line);
    } else {
        error(&format!(
            "{line}, {} failed, {} skipped",
            summary.failed, summary.skipped
        ));
    }
}
