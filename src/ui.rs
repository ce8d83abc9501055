use colored::{ColoredString, Colorize};
use converge::{Action, NodeOutcome};
use std::time::Duration;

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// `+`, `~` or `=` for a planned action
pub fn action_symbol(action: Action) -> ColoredString {
    match action {
        Action::Create => "+".green(),
        Action::Update => "~".yellow(),
        Action::NoOp => "=".dimmed(),
    }
}

/// Symbol for a finished node
pub fn outcome_symbol(outcome: &NodeOutcome) -> ColoredString {
    match outcome {
        NodeOutcome::Created | NodeOutcome::Updated => "✓".green(),
        NodeOutcome::NoChange => "○".dimmed(),
        NodeOutcome::Planned { action } => action_symbol(*action),
        NodeOutcome::Failed { .. } => "✗".red(),
        NodeOutcome::Skipped { .. } => "⊘".yellow(),
    }
}

/// Format an elapsed time as `850ms`, `12.3s` or `2m05s`
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else {
        let secs = elapsed.as_secs();
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

/// `1 resource`, `3 resources`
pub fn count(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("{} {}", n, noun)
    } else {
        format!("{} {}s", n, noun)
    }
}

// ============================================================================
// Tests
// ============================================================================
