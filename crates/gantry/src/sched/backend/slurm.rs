//! Slurm backend. Node data comes from `scontrol show node`, reservations
//! from `scontrol show reservation`, submission goes through `sbatch` and
//! status through `scontrol show job`.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, anyhow, bail};
use chrono::NaiveDateTime;
use itertools::Itertools;
use serde_json::{Value, json};

use crate::Map;
use crate::common::strutils::format_hms;
use crate::sched::backend::{
    AdvancedBackend, AllocRequest, AllocTarget, BackendJobStatus, BackendResult, BasicBackend,
    RawNodeData,
};
use crate::sched::config::{ReservationRequest, ScheduleConfig};
use crate::sched::job::{Job, JobInfo};
use crate::sched::nodes::{Node, NodeList};

const SLURM_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct SlurmBackend {
    /// Shell command the batch script runs inside the allocation.
    run_cmd: String,
}

impl SlurmBackend {
    pub fn new(run_cmd: impl Into<String>) -> Self {
        SlurmBackend {
            run_cmd: run_cmd.into(),
        }
    }
}

fn command_output(program: &str, args: &[&str]) -> BackendResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Could not execute {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} {} failed ({}): {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `Key=Value Key2=Value2 ...` output of scontrol into a map. Values
/// never contain spaces in the fields we read; everything after an unpaired
/// token is skipped.
fn parse_scontrol_items(output: &str) -> Map<String, String> {
    let mut items = Map::default();
    for token in output.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            items.insert(key.to_string(), value.to_string());
        }
    }
    items
}

/// Split `scontrol show node`/`show reservation` output into per-record item
/// maps. Records are separated by blank lines.
fn parse_scontrol_records(output: &str) -> Vec<Map<String, String>> {
    output
        .split("\n\n")
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(parse_scontrol_items)
        .collect()
}

/// Render the `#SBATCH` header lines for one allocation request.
fn render_sbatch_header(job: &Job, request: &AllocRequest) -> Vec<String> {
    let mut lines = vec![
        format!("#SBATCH --job-name=\"{}\"", request.job_name),
        format!("#SBATCH --output={}", job.kickoff_log().display()),
    ];

    match &request.target {
        AllocTarget::Nodes(nodes) => {
            lines.push(format!("#SBATCH --nodelist={}", nodes.iter().join(",")));
            lines.push(format!("#SBATCH --nodes={}", nodes.len()));
        }
        AllocTarget::Range(range) => match range.max {
            Some(max) if max == range.min => {
                lines.push(format!("#SBATCH --nodes={max}"));
            }
            Some(max) => {
                lines.push(format!("#SBATCH --nodes={}-{max}", range.min));
            }
            // Sizing driven purely by tasks; Slurm picks the node count.
            None => {
                lines.push(format!("#SBATCH --nodes={}", range.min));
                if let Some(tasks) = request.config.tasks {
                    lines.push(format!("#SBATCH --ntasks={tasks}"));
                }
            }
        },
    }

    let config = request.config;
    if let Some(partition) = &config.partition {
        lines.push(format!("#SBATCH --partition={partition}"));
    }
    if let Some(ReservationRequest::Named(reservation)) = &config.reservation {
        lines.push(format!("#SBATCH --reservation={reservation}"));
    }
    if let Some(qos) = &config.qos {
        lines.push(format!("#SBATCH --qos={qos}"));
    }
    if let Some(account) = &config.account {
        lines.push(format!("#SBATCH --account={account}"));
    }
    if !config.exclude_nodes.is_empty() {
        lines.push(format!(
            "#SBATCH --exclude={}",
            config.exclude_nodes.iter().join(",")
        ));
    }
    if let Some(time_limit) = &request.time_limit {
        lines.push(format!("#SBATCH --time={}", format_hms(time_limit)));
    }

    lines
}

fn build_batch_script(job: &Job, request: &AllocRequest, run_cmd: &str) -> String {
    let header = render_sbatch_header(job, request).join("\n");
    format!("#!/bin/bash\n{header}\n\n{run_cmd}\n")
}

fn write_script(path: &Path, script: &str) -> BackendResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, script)
        .with_context(|| format!("Could not write batch script {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Could not chmod batch script {}", path.display()))?;
    Ok(())
}

/// Pull the job id out of sbatch's `Submitted batch job NNN` output.
fn parse_sbatch_output(output: &str) -> BackendResult<String> {
    output
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix("Submitted batch job "))
        .map(|id| id.trim().to_string())
        .ok_or_else(|| anyhow!("Unexpected sbatch output: {output:?}"))
}

/// Map `scontrol show job` items onto the backend status taxonomy. `None`
/// means the job finished (or was lost) and the scheduler has nothing more
/// to say about it.
fn interpret_job_state(items: &Map<String, String>) -> BackendResult<Option<BackendJobStatus>> {
    let state = items
        .get("JobState")
        .ok_or_else(|| anyhow!("scontrol job record is missing JobState"))?;
    let reason = || {
        items
            .get("Reason")
            .filter(|reason| *reason != "None")
            .cloned()
            .unwrap_or_else(|| "no reason given".to_string())
    };

    let status = match state.as_str() {
        "PENDING" | "CONFIGURING" => {
            if let Some(submitted) = items
                .get("SubmitTime")
                .and_then(|t| NaiveDateTime::parse_from_str(t, SLURM_TIME_FORMAT).ok())
            {
                log::trace!("Job has been waiting in queue since {submitted}");
            }
            Some(BackendJobStatus::Queued)
        }
        "RUNNING" | "COMPLETING" => Some(BackendJobStatus::Running),
        "COMPLETED" => None,
        "CANCELLED" => Some(BackendJobStatus::Cancelled(reason())),
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "BOOT_FAIL" | "DEADLINE" | "OUT_OF_MEMORY"
        | "PREEMPTED" => Some(BackendJobStatus::Failed(format!("{state}: {}", reason()))),
        other => bail!("Unknown Slurm job state '{other}'"),
    };
    Ok(status)
}

impl BasicBackend for SlurmBackend {
    fn label(&self) -> &str {
        "slurm"
    }

    fn available(&self) -> bool {
        Command::new("sbatch")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn kickoff(&mut self, job: &Job, request: &AllocRequest) -> BackendResult<JobInfo> {
        let script = build_batch_script(job, request, &self.run_cmd);
        let path = job.kickoff_path();
        write_script(&path, &script)?;

        let output = command_output("sbatch", &[&path.display().to_string()])?;
        let id = parse_sbatch_output(&output)?;
        Ok(JobInfo { id, host: None })
    }

    fn alloc_nodes(&self, job: &Job) -> BackendResult<NodeList> {
        let info = job
            .info
            .as_ref()
            .ok_or_else(|| anyhow!("Job {} was never submitted", job.id))?;
        let output = command_output("scontrol", &["show", "job", &info.id])?;
        let items = parse_scontrol_items(&output);
        let expr = items
            .get("NodeList")
            .filter(|list| *list != "(null)")
            .ok_or_else(|| anyhow!("Job {} has no node list yet", info.id))?;
        // Expand compressed expressions like cn[01-04].
        let expanded = command_output("scontrol", &["show", "hostnames", expr])?;
        Ok(expanded.lines().map(|line| line.trim().to_string()).collect())
    }

    fn job_status(&mut self, info: &JobInfo) -> BackendResult<Option<BackendJobStatus>> {
        let output = Command::new("scontrol")
            .args(["show", "job", &info.id])
            .output()
            .context("Could not execute scontrol")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Old enough jobs fall out of scontrol's memory entirely.
            if stderr.contains("Invalid job id specified") {
                return Ok(None);
            }
            bail!("scontrol show job {} failed: {}", info.id, stderr.trim());
        }
        let items = parse_scontrol_items(&String::from_utf8_lossy(&output.stdout));
        interpret_job_state(&items)
    }

    fn cancel(&mut self, info: &JobInfo) -> Option<String> {
        match command_output("scancel", &[&info.id]) {
            Ok(_) => None,
            Err(error) => Some(format!("{error:#}")),
        }
    }
}

impl AdvancedBackend for SlurmBackend {
    fn raw_node_data(&mut self, _config: &ScheduleConfig) -> BackendResult<RawNodeData> {
        let output = command_output("scontrol", &["show", "node"])?;
        let nodes = parse_scontrol_records(&output)
            .into_iter()
            .map(|items| json!(items))
            .collect();

        // Reservation membership is only visible from the reservation side;
        // hand it to transform() as the shared extra value.
        let output = command_output("scontrol", &["show", "reservation"])
            .unwrap_or_default();
        let mut reservations = Map::<String, Vec<String>>::default();
        for record in parse_scontrol_records(&output) {
            if let (Some(name), Some(expr)) =
                (record.get("ReservationName"), record.get("Nodes"))
            {
                let expanded = command_output("scontrol", &["show", "hostnames", expr])?;
                reservations.insert(
                    name.clone(),
                    expanded.lines().map(|line| line.trim().to_string()).collect(),
                );
            }
        }

        Ok((nodes, json!(reservations)))
    }

    fn transform(
        &self,
        _config: &ScheduleConfig,
        raw: &Value,
        extra: &Value,
    ) -> BackendResult<Node> {
        let item = |key: &str| raw.get(key).and_then(Value::as_str);

        let name = item("NodeName")
            .ok_or_else(|| anyhow!("Slurm node record is missing NodeName"))?
            .to_string();
        let state = item("State").unwrap_or("UNKNOWN");
        let up = !["DOWN", "DRAIN", "DRAINING", "DRAINED", "MAINT", "INVAL", "FAIL"]
            .iter()
            .any(|bad| state.contains(bad));
        let available = up && state.starts_with("IDLE");

        let split_list = |key: &str| -> Vec<String> {
            item(key)
                .filter(|value| *value != "(null)")
                .map(|value| value.split(',').map(str::to_string).collect())
                .unwrap_or_default()
        };

        let reservations = extra
            .as_object()
            .map(|reservations| {
                reservations
                    .iter()
                    .filter(|(_, nodes)| {
                        nodes
                            .as_array()
                            .is_some_and(|nodes| nodes.iter().any(|n| n.as_str() == Some(&name)))
                    })
                    .map(|(reservation, _)| reservation.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Node {
            name,
            up,
            available,
            cpus: item("CPUTot").and_then(|value| value.parse().ok()),
            mem_bytes: item("RealMemory")
                .and_then(|value| value.parse::<u64>().ok())
                .map(|mb| mb * 1024 * 1024),
            partitions: split_list("Partitions"),
            reservations,
            features: split_list("AvailableFeatures"),
            extra: Map::default(),
        })
    }

    fn custom_filter(&self, _config: &ScheduleConfig, _name: &str, node: &Node) -> Option<String> {
        // Draining nodes report as up until the last job leaves; catch them
        // through the raw state kept at transform time.
        if !node.up {
            return Some("slurm: node is down or draining".to_string());
        }
        None
    }
}
