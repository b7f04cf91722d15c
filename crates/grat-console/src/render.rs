use chrono::{DateTime, Utc};
use grat_core::task_api::{AgentSummary, ServerStatus, TaskResultPayload, TaskSummary};
use grat_core::{BulkResult, TaskOutcome};

pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn outcome_message(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Completed { output } if output.is_empty() => {
            "Command executed with no output".to_string()
        }
        TaskOutcome::Completed { output } => output.trim_end_matches('\n').to_string(),
        TaskOutcome::Failed { error } => format!("Error: {error}"),
        TaskOutcome::TimedOut => {
            "Error: command timed out; it may still be running on the agent".to_string()
        }
        TaskOutcome::Cancelled => "Cancelled: stopped waiting for the result".to_string(),
        TaskOutcome::Pending => "Task is still pending".to_string(),
    }
}

pub fn bulk_summary(action: &str, result: &BulkResult) -> String {
    format!(
        "{action} completed on {} agent(s). {} error(s) occurred.",
        result.succeeded, result.failed
    )
}

pub fn result_message(payload: &TaskResultPayload) -> String {
    if !matches!(payload.outcome(), TaskOutcome::Completed { .. } | TaskOutcome::Failed { .. }) {
        return "Task is still pending".to_string();
    }
    let mut text = payload
        .output
        .as_deref()
        .filter(|output| !output.is_empty())
        .unwrap_or("No output available")
        .trim_end_matches('\n')
        .to_string();
    if let Some(error) = payload.error.as_deref().filter(|error| !error.trim().is_empty()) {
        text.push_str(&format!("\n\nError: {error}"));
    }
    text
}

pub fn agent_table(agents: &[AgentSummary], now: DateTime<Utc>) -> String {
    let mut sorted: Vec<&AgentSummary> = agents.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let rows = sorted.into_iter().map(|agent| {
        vec![
            agent.id.clone(),
            or_unknown(&agent.system_info.hostname),
            or_unknown(&agent.ip),
            or_unknown(&agent.system_info.os),
            or_unknown(&agent.system_info.username),
            if agent.online { "online" } else { "offline" }.to_string(),
            agent
                .last_seen
                .map(|seen| relative_age(seen, now))
                .unwrap_or_else(|| "unknown".to_string()),
        ]
    });
    columns(
        &["ID", "HOSTNAME", "IP", "OS", "USER", "STATUS", "LAST SEEN"],
        rows,
    )
}

/// Oldest first; tasks without a creation time go last.
pub fn task_table(tasks: &[TaskSummary], now: DateTime<Utc>) -> String {
    let mut sorted: Vec<&TaskSummary> = tasks.iter().collect();
    sorted.sort_by(|a, b| match (a.create_time, b.create_time) {
        (Some(left), Some(right)) => left.cmp(&right).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });
    let rows = sorted.into_iter().map(|task| {
        vec![
            or_unknown(&task.id),
            task.agent_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| "all".to_string()),
            or_unknown(&task.kind),
            task.command.clone(),
            task.create_time
                .map(|created| relative_age(created, now))
                .unwrap_or_else(|| "unknown".to_string()),
            task.status_label().to_string(),
        ]
    });
    columns(&["ID", "AGENT", "TYPE", "COMMAND", "CREATED", "STATUS"], rows)
}

pub fn server_status(status: &ServerStatus) -> String {
    let mut text = format!(
        "Server {} up {}, {} agent(s) connected",
        if status.version.trim().is_empty() {
            "(unknown version)"
        } else {
            status.version.as_str()
        },
        uptime(status.uptime),
        status.agents
    );
    for activity in &status.recent_activity {
        text.push_str(&format!("\n  - {activity}"));
    }
    text
}

fn uptime(secs: u64) -> String {
    let (hours, minutes, seconds) = (secs / 3_600, secs % 3_600 / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn columns<R>(header: &[&str], rows: R) -> String
where
    R: IntoIterator<Item = Vec<String>>,
{
    let mut table: Vec<Vec<String>> = vec![header.iter().map(|cell| cell.to_string()).collect()];
    table.extend(rows);

    let mut widths = vec![0usize; header.len()];
    for row in &table {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for row in &table {
        let line = row
            .iter()
            .enumerate()
            .map(|(idx, cell)| format!("{cell:<width$}", width = widths[idx]))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn or_unknown(value: &str) -> String {
    if value.trim().is_empty() {
        "unknown".to_string()
    } else {
        value.to_string()
    }
}

fn relative_age(seen: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - seen).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
