//! Parsing of `squeue` output.

use chrono::NaiveDateTime;

use crate::backend::{JobState, SqueueRow};

/// Column layout requested from `squeue`, one `|`-separated field each:
/// account, job id, exec host, cpus, nodes, group, name, partition, state,
/// reason, start time, end time, submit time, work dir, command.
pub const SQUEUE_FORMAT: &str = "%a|%A|%B|%C|%D|%G|%j|%P|%T|%r|%S|%e|%V|%Z|%o";

const COLUMNS: usize = 15;
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Shell command listing all jobs in all states.
pub fn squeue_command() -> String {
    format!("squeue -h -a -t all --format='{SQUEUE_FORMAT}'")
}

/// Shell command for a single job. `job_id` must already be validated.
pub fn squeue_job_command(job_id: &str) -> String {
    format!("squeue -h -a -t all -j {job_id} --format='{SQUEUE_FORMAT}'")
}

fn optional(value: &str) -> Option<&str> {
    match value.trim() {
        "" | "N/A" | "n/a" | "(null)" | "None" => None,
        s => Some(s),
    }
}

fn parse_time(value: &str) -> Result<Option<NaiveDateTime>, String> {
    optional(value)
        .map(|s| NaiveDateTime::parse_from_str(s, TIME_FORMAT))
        .transpose()
        .map_err(|e| format!("bad time '{value}': {e}"))
}

fn parse_count(value: &str, column: &str) -> Result<usize, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("bad {column} '{value}'"))
}

/// Parse one line of output produced with [`SQUEUE_FORMAT`].
pub fn parse_row(line: &str) -> Result<SqueueRow, String> {
    // The command column is last and may itself contain '|'
    let fields: Vec<&str> = line.splitn(COLUMNS, '|').collect();
    if fields.len() != COLUMNS {
        return Err(format!(
            "expected {COLUMNS} columns, found {}",
            fields.len()
        ));
    }

    Ok(SqueueRow {
        account: fields[0].trim().to_string(),
        job_id: fields[1].trim().to_string(),
        exec_host: optional(fields[2]).map(str::to_string),
        cpus: parse_count(fields[3], "cpus")?,
        nodes: parse_count(fields[4], "nodes")?,
        group: fields[5].trim().to_string(),
        name: fields[6].trim().to_string(),
        partition: fields[7].trim().to_string(),
        state: JobState::from(fields[8]),
        reason: fields[9].trim().to_string(),
        start_time: parse_time(fields[10])?,
        end_time: parse_time(fields[11])?,
        submit_time: parse_time(fields[12])?,
        work_dir: fields[13].trim().to_string(),
        command: fields[14].trim().to_string(),
    })
}

/// Parse a whole listing. Malformed lines are logged and skipped.
pub fn parse_output(output: &str) -> Vec<SqueueRow> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_row(line) {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::warn!(line, error = %e, "Skipping malformed squeue line");
                None
            }
        })
        .collect()
}
