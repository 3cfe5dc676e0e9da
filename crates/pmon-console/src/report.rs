use pmon_core::{Instance, TaskState};
use pmon_sync::{Console, Lamp};
use std::fmt::Write as _;

pub fn render(console: &Console) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== cycle {} ==", console.cycles_applied());
    render_lamp(&mut out, console.lamp());
    if let Some(err) = console.last_error() {
        let _ = writeln!(out, "last error: {err}");
    }
    render_instances(&mut out, console);
    render_tasks(&mut out, console);
    out
}

fn render_lamp(out: &mut String, lamp: Option<Lamp>) {
    match lamp {
        Some(lamp) => match lamp.message {
            Some(message) => {
                let _ = writeln!(out, "lamp: {} - {message}", lamp.color);
            }
            None => {
                let _ = writeln!(out, "lamp: {}", lamp.color);
            }
        },
        None => out.push_str("lamp: -\n"),
    }
}

fn render_instances(out: &mut String, console: &Console) {
    let instances = console.instances().instances();
    let selected = console.selection().selected_instance();
    let _ = writeln!(out, "instances ({}):", instances.len());
    for instance in instances.iter() {
        let marker = if Some(instance.id) == selected { '>' } else { ' ' };
        let _ = writeln!(
            out,
            " {marker} {:>6}  {:<15} {:<32} {}",
            instance.id.0,
            instance.state.as_str(),
            instance.display_name(),
            instance_timing(instance)
        );
    }
}

fn instance_timing(instance: &Instance) -> String {
    let created = instance.created.format("%Y-%m-%d %H:%M");
    match (instance.started, instance.ended) {
        (Some(started), Some(ended)) => {
            let minutes = (ended - started).num_minutes();
            format!("created {created}, ran {minutes}m")
        }
        (Some(started), None) => format!("created {created}, started {}", started.format("%H:%M")),
        _ => format!("created {created}"),
    }
}

fn render_tasks(out: &mut String, console: &Console) {
    let Some(instance_id) = console.selection().selected_instance() else {
        return;
    };
    let tasks = console.tasks();
    let snapshot = tasks.published_snapshot();
    let selected_rows = console.selection().selected_task_rows();
    let _ = writeln!(out, "tasks of instance {instance_id} ({}):", snapshot.tasks.len());
    for (row, task) in snapshot.tasks.iter().enumerate() {
        let marker = if selected_rows.contains(&row) { '*' } else { ' ' };
        let detail = match snapshot.attributes_for(task.id) {
            Some(attrs) => format!(
                "{} {}/{} ({} failed)",
                attrs.processing_state,
                attrs.completed_subtask_count,
                attrs.total_subtask_count,
                attrs.failed_subtask_count
            ),
            None => "-".to_string(),
        };
        let _ = writeln!(
            out,
            " {marker} {:>8}  {:<12} {:<20} {detail}",
            task.id.0,
            task.state.as_str(),
            task.module_name
        );
    }

    let counts = tasks.aggregate_state_counts();
    let scoreboard: Vec<String> = TaskState::ALL
        .iter()
        .map(|state| format!("{}={}", state, counts.get(state).copied().unwrap_or(0)))
        .collect();
    let _ = writeln!(out, "scoreboard: {}", scoreboard.join(" "));
    for summary in tasks.module_summaries() {
        let _ = writeln!(
            out,
            "  {:<20} tasks={} subtasks={}/{} failed={}",
            summary.module_name,
            summary.task_count(),
            summary.subtask_complete,
            summary.subtask_total,
            summary.subtask_failed
        );
    }

    let restartable = tasks.restart_candidates(&[]);
    if !restartable.is_empty() {
        let ids: Vec<String> = restartable.iter().map(|task| task.id.to_string()).collect();
        let _ = writeln!(out, "restartable: {}", ids.join(", "));
    }
}
