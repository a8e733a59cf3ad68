// Output formatting and display for CLI

use crate::ipc::{ResponseData, StartReport};
use crate::process::{InstanceSnapshot, InstanceState, ReloadReport};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a success response to stdout
pub fn print_success(data: &ResponseData) {
    match data {
        ResponseData::Started(report) => print_start_report(report),

        ResponseData::Stopped { instances, failed } => {
            print_instances("stopped", instances);
            for (id, error) in failed {
                println!("{} {} failed to stop: {}", "✗".red().bold(), id.cyan(), error);
            }
        }

        ResponseData::Restarted { instances } => {
            print_instances("restarted", instances);
        }

        ResponseData::Reloaded(report) => print_reload_report(report),

        ResponseData::Status(instances) => {
            if instances.is_empty() {
                println!("{}", "No apps are registered".yellow());
            } else {
                print_status_table(instances);
            }
        }

        ResponseData::Pong {
            version,
            pid,
            uptime_secs,
        } => {
            println!("{}", "✓ Daemon is running".green().bold());
            println!("  {}: {}", "Version".bold(), version);
            println!("  {}: {}", "PID".bold(), pid);
            println!(
                "  {}: {}",
                "Uptime".bold(),
                format_duration(&Duration::from_secs(*uptime_secs))
            );
        }

        ResponseData::ShuttingDown => {
            println!("{}", "✓ Daemon is shutting down".green().bold());
        }
    }
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

fn print_instances(verb: &str, instances: &[String]) {
    if instances.is_empty() {
        println!("{}", format!("Nothing {}", verb).yellow());
        return;
    }
    for instance in instances {
        println!("{} {} {}", "✓".green().bold(), instance.cyan(), verb);
    }
}

fn print_start_report(report: &StartReport) {
    for id in &report.started {
        println!("{} {} started", "✓".green().bold(), id.cyan());
    }
    for id in &report.already_running {
        println!("{} {} already running", "ℹ".blue().bold(), id.cyan());
    }
    for (id, error) in &report.failed {
        println!("{} {} failed: {}", "✗".red().bold(), id.cyan(), error);
    }
}

fn print_reload_report(report: &ReloadReport) {
    println!(
        "{}",
        format!("✓ Reloaded (generation {})", report.generation)
            .green()
            .bold()
    );
    let sections = [
        ("Added", &report.added),
        ("Changed", &report.changed),
        ("Removed", &report.removed),
        ("Unchanged", &report.unchanged),
    ];
    for (label, names) in sections {
        if !names.is_empty() {
            println!("  {}: {}", label.bold(), names.join(", "));
        }
    }
    for (id, error) in &report.failed {
        println!("  {} {}: {}", "✗".red().bold(), id.cyan(), error);
    }
}

/// Print a formatted table of instances
fn print_status_table(instances: &[InstanceSnapshot]) {
    #[derive(Tabled)]
    struct InstanceRow {
        #[tabled(rename = "Instance")]
        instance: String,
        #[tabled(rename = "Mode")]
        mode: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Last Exit")]
        last_exit: String,
    }

    let rows: Vec<InstanceRow> = instances
        .iter()
        .map(|i| InstanceRow {
            instance: truncate(&i.instance_id, 24),
            mode: i.mode.to_string(),
            state: format_state_colored(i),
            pid: i
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            cpu: format!("{:.1}%", i.cpu_usage),
            memory: format_memory(i.memory_usage),
            uptime: i
                .uptime_secs
                .map(|secs| format_duration(&Duration::from_secs(secs)))
                .unwrap_or_else(|| "-".to_string()),
            restarts: i.restart_count.to_string(),
            last_exit: i
                .last_exit_cause
                .map(|cause| cause.to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} instance(s)", instances.len())
            .dimmed()
            .italic()
    );
}

/// State with color coding; a pending restart shows as "waiting restart"
fn format_state_colored(instance: &InstanceSnapshot) -> String {
    if instance.restart_pending {
        return "waiting restart".yellow().to_string();
    }
    let state = instance.state.to_string();
    match instance.state {
        InstanceState::Running => state.green().to_string(),
        InstanceState::Starting | InstanceState::Stopping => state.yellow().to_string(),
        InstanceState::Stopped => state.bright_black().to_string(),
        InstanceState::Crashed => state.red().bold().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => match secs % 60 {
            0 => format!("{}m", secs / 60),
            rem => format!("{}m {}s", secs / 60, rem),
        },
        3600..=86399 => match (secs % 3600) / 60 {
            0 => format!("{}h", secs / 3600),
            mins => format!("{}h {}m", secs / 3600, mins),
        },
        _ => match (secs % 86400) / 3600 {
            0 => format!("{}d", secs / 86400),
            hours => format!("{}d {}h", secs / 86400, hours),
        },
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ExecMode;

    fn snapshot(state: InstanceState, restart_pending: bool) -> InstanceSnapshot {
        InstanceSnapshot {
            name: "api".to_string(),
            instance_id: "api#0".to_string(),
            ordinal: 0,
            mode: ExecMode::Single,
            state,
            pid: None,
            uptime_secs: None,
            started_at: None,
            restart_count: 0,
            memory_usage: 0,
            cpu_usage: 0.0,
            last_exit_code: None,
            last_exit_cause: None,
            last_error: None,
            restart_pending,
            gave_up: false,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(&Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(&Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(&Duration::from_secs(3700)), "1h 1m");
        assert_eq!(format_duration(&Duration::from_secs(90000)), "1d 1h");
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(512), "512B");
        assert_eq!(format_memory(2048), "2.0KB");
        assert_eq!(format_memory(2 * 1024 * 1024), "2.0MB");
        assert_eq!(format_memory(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("nextjs-app#0", 24), "nextjs-app#0");
        assert_eq!(truncate("a-very-long-application-name#12", 10), "a-very-...");
    }

    #[test]
    fn test_pending_restart_overrides_state() {
        colored::control::set_override(false);
        assert_eq!(
            format_state_colored(&snapshot(InstanceState::Crashed, true)),
            "waiting restart"
        );
        assert_eq!(
            format_state_colored(&snapshot(InstanceState::Crashed, false)),
            "crashed"
        );
    }
}
