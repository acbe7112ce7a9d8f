use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Prefix of sequential job node names; anything else under a board path
/// (lock nodes, queue subtrees) is not a job.
pub const JOB_PREFIX: &str = "job";
pub const LOCK_SUFFIX: &str = ".lock";

/// Detail key holding the stored flow reference.
pub const FLOW_UUID_KEY: &str = "flow_uuid";
/// Detail key holding the execution-scoped parameter snapshot.
pub const STORE_KEY: &str = "store";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Unclaimed,
    Claimed,
    /// The job node is gone (consumed or expired).
    Complete,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Unclaimed => write!(f, "unclaimed"),
            JobState::Claimed => write!(f, "claimed"),
            JobState::Complete => write!(f, "complete"),
        }
    }
}

/// Reference to the logbook a job's flow detail lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRef {
    pub name: String,
    pub uuid: Uuid,
}

/// The immutable part of a job, stored as the job node's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub book: Option<BookRef>,
    pub created_on: DateTime<Utc>,
}

impl JobPosting {
    pub fn new(name: &str, book: Option<BookRef>, details: Map<String, Value>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            details,
            book,
            created_on: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    path: String,
    sequence: u64,
    posting: JobPosting,
}

impl Job {
    pub fn new(path: String, sequence: u64, posting: JobPosting) -> Self {
        Self {
            path,
            sequence,
            posting,
        }
    }

    /// Namespace path; this is the job's identity.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn lock_path(&self) -> String {
        format!("{}{}", self.path, LOCK_SUFFIX)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn uuid(&self) -> Uuid {
        self.posting.uuid
    }

    pub fn name(&self) -> &str {
        &self.posting.name
    }

    pub fn details(&self) -> &Map<String, Value> {
        &self.posting.details
    }

    pub fn book(&self) -> Option<&BookRef> {
        self.posting.book.as_ref()
    }

    pub fn created_on(&self) -> DateTime<Utc> {
        self.posting.created_on
    }

    pub fn posting(&self) -> &JobPosting {
        &self.posting
    }

    /// String value of a detail key, if present and a string.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.posting.details.get(key).and_then(Value::as_str)
    }

    pub fn flow_uuid(&self) -> Option<Uuid> {
        self.detail_str(FLOW_UUID_KEY)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.posting.name, self.posting.uuid, self.path)
    }
}

/// Whether a child name under a board path is a job node.
pub fn is_job_node(name: &str) -> bool {
    name.starts_with(JOB_PREFIX) && !name.ends_with(LOCK_SUFFIX)
}

/// Sequence number encoded in a sequential job node name.
pub fn parse_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(JOB_PREFIX)?.parse().ok()
}

/// Data stored in a claim's lock node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LockData {
    pub owner: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_node_names() {
        assert!(is_job_node("job0000000003"));
        assert!(!is_job_node("job0000000003.lock"));
        assert!(!is_job_node("app1"));
        assert_eq!(parse_sequence("job0000000042"), Some(42));
        assert_eq!(parse_sequence("jobabc"), None);
    }

    #[test]
    fn flow_uuid_is_read_from_details() {
        let flow = Uuid::new_v4();
        let mut details = Map::new();
        details.insert(FLOW_UUID_KEY.into(), json!(flow.to_string()));
        let job = Job::new("/jobs/job0000000000".into(), 0, JobPosting::new("j", None, details));
        assert_eq!(job.flow_uuid(), Some(flow));
        assert_eq!(job.lock_path(), "/jobs/job0000000000.lock");
    }
}
