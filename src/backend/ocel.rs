//! Object-centric event log (OCEL 2.0 JSON) built from recorded queue snapshots.
//!
//! Each job becomes a `Job` object related to its account, group, partition
//! and execution host. Events are derived from the state changes observed
//! between consecutive snapshots: the first sighting of a job yields
//! `Submit Job`, a move to `RUNNING` yields `Job Started`, and a move into a
//! terminal state yields the matching `Job …` event.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{JobState, QueueSnapshot, SqueueRow};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcelAttributeType {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcelType {
    pub name: String,
    pub attributes: Vec<OcelAttributeType>,
}

impl OcelType {
    fn new(name: &str, attributes: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            attributes: attributes
                .iter()
                .map(|(name, value_type)| OcelAttributeType {
                    name: name.to_string(),
                    value_type: value_type.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcelRelationship {
    pub object_id: String,
    pub qualifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcelObjectAttribute {
    pub name: String,
    pub time: DateTime<Utc>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcelObject {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub attributes: Vec<OcelObjectAttribute>,
    pub relationships: Vec<OcelRelationship>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcelEventAttribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcelEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    pub attributes: Vec<OcelEventAttribute>,
    pub relationships: Vec<OcelRelationship>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ocel {
    pub object_types: Vec<OcelType>,
    pub event_types: Vec<OcelType>,
    pub objects: Vec<OcelObject>,
    pub events: Vec<OcelEvent>,
}

fn event_type_for(state: &JobState) -> Option<&'static str> {
    match state {
        JobState::Running => Some("Job Started"),
        JobState::Completing => Some("Job Ending"),
        JobState::Completed => Some("Job Completed"),
        JobState::Cancelled => Some("Job Cancelled"),
        JobState::Failed => Some("Job Failed"),
        JobState::Timeout => Some("Job Timeout"),
        JobState::OutOfMemory => Some("Job Out Of Memory"),
        JobState::NodeFail => Some("Job Node Fail"),
        JobState::Pending | JobState::Other(_) => None,
    }
}

fn schema() -> (Vec<OcelType>, Vec<OcelType>) {
    let object_types = vec![
        OcelType::new(
            "Job",
            &[
                ("state", "string"),
                ("command", "string"),
                ("work_dir", "string"),
                ("cpus", "integer"),
            ],
        ),
        OcelType::new("Account", &[]),
        OcelType::new("Group", &[]),
        OcelType::new("Host", &[]),
        OcelType::new("Partition", &[]),
    ];
    let mut event_types: Vec<OcelType> = [
        "Submit Job",
        "Job Started",
        "Job Ending",
        "Job Completed",
        "Job Cancelled",
        "Job Timeout",
        "Job Out Of Memory",
        "Job Node Fail",
    ]
    .iter()
    .map(|name| OcelType::new(name, &[]))
    .collect();
    event_types.push(OcelType::new("Job Failed", &[("reason", "string")]));
    (object_types, event_types)
}

fn relate(object_id: &str, qualifier: &str) -> OcelRelationship {
    OcelRelationship {
        object_id: object_id.to_string(),
        qualifier: qualifier.to_string(),
    }
}

fn job_object(row: &SqueueRow, first_seen: DateTime<Utc>) -> OcelObject {
    let attribute = |name: &str, value: String| OcelObjectAttribute {
        name: name.to_string(),
        time: first_seen,
        value,
    };
    let mut relationships = vec![
        relate(&format!("acc_{}", row.account), "submitter"),
        relate(&format!("group_{}", row.group), "for"),
        relate(&format!("part_{}", row.partition), "partition"),
    ];
    if let Some(host) = &row.exec_host {
        relationships.push(relate(&format!("host_{host}"), "host"));
    }
    OcelObject {
        id: row.job_id.clone(),
        object_type: "Job".to_string(),
        attributes: vec![
            attribute("state", row.state.to_string()),
            attribute("command", row.command.clone()),
            attribute("work_dir", row.work_dir.clone()),
            attribute("cpus", row.cpus.to_string()),
        ],
        relationships,
    }
}

/// Build the event log. Snapshots are processed in time order; rows without
/// a job id are ignored.
pub fn build_ocel(snapshots: &[QueueSnapshot]) -> Ocel {
    let mut ordered: Vec<&QueueSnapshot> = snapshots.iter().collect();
    ordered.sort_by_key(|s| s.time);

    let (object_types, event_types) = schema();
    let mut jobs: BTreeMap<String, OcelObject> = BTreeMap::new();
    let mut last_state: BTreeMap<String, JobState> = BTreeMap::new();
    let mut others: BTreeSet<(&'static str, &'static str, String)> = BTreeSet::new();
    let mut events = Vec::new();

    let mut push_event = |event_type: &str,
                          time: DateTime<Utc>,
                          row: &SqueueRow,
                          attributes: Vec<OcelEventAttribute>| {
        let mut relationships = vec![relate(&row.job_id, "job")];
        if let Some(host) = &row.exec_host {
            relationships.push(relate(&format!("host_{host}"), "host"));
        }
        events.push(OcelEvent {
            id: format!("{}_{}", row.job_id, events.len()),
            event_type: event_type.to_string(),
            time,
            attributes,
            relationships,
        });
    };

    for snapshot in ordered {
        for row in snapshot.rows.iter().filter(|r| !r.job_id.is_empty()) {
            let previous = last_state.insert(row.job_id.clone(), row.state.clone());
            match &previous {
                None => {
                    let submitted = row
                        .submit_time
                        .map(|t| t.and_utc())
                        .unwrap_or(snapshot.time);
                    push_event("Submit Job", submitted, row, Vec::new());
                    jobs.insert(row.job_id.clone(), job_object(row, snapshot.time));
                }
                Some(previous) if *previous != row.state => {
                    if let Some(job) = jobs.get_mut(&row.job_id) {
                        job.attributes.push(OcelObjectAttribute {
                            name: "state".to_string(),
                            time: snapshot.time,
                            value: row.state.to_string(),
                        });
                    }
                }
                Some(_) => continue,
            }
            if let Some(event_type) = event_type_for(&row.state) {
                push_event(event_type, snapshot.time, row, failure_reason(row));
            }

            others.insert(("Account", "acc_", row.account.clone()));
            others.insert(("Group", "group_", row.group.clone()));
            others.insert(("Partition", "part_", row.partition.clone()));
            if let Some(host) = &row.exec_host {
                others.insert(("Host", "host_", host.clone()));
            }
        }
    }

    let mut objects: Vec<OcelObject> = jobs.into_values().collect();
    objects.extend(
        others
            .into_iter()
            .filter(|(_, _, name)| !name.is_empty())
            .map(|(object_type, prefix, name)| OcelObject {
                id: format!("{prefix}{name}"),
                object_type: object_type.to_string(),
                attributes: Vec::new(),
                relationships: Vec::new(),
            }),
    );

    Ocel {
        object_types,
        event_types,
        objects,
        events,
    }
}

fn failure_reason(row: &SqueueRow) -> Vec<OcelEventAttribute> {
    if row.state == JobState::Failed {
        vec![OcelEventAttribute {
            name: "reason".to_string(),
            value: row.reason.clone(),
        }]
    } else {
        Vec::new()
    }
}
