use serde::{Deserialize, Serialize};

/// In-memory mirror of a deployment in flight. Garbage collected on process
/// restart; the [crate::entities::Deployment] record in the store is
/// authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
  pub deployment_id: String,
  pub step: JobStep,
  /// Last ~20 human-readable progress lines.
  #[serde(default)]
  pub log: Vec<String>,
}

const JOB_LOG_CAPACITY: usize = 20;

impl Job {
  pub fn new(deployment_id: impl Into<String>) -> Self {
    Self {
      deployment_id: deployment_id.into(),
      step: JobStep::Queued,
      log: Vec::new(),
    }
  }

  pub fn push_log(&mut self, line: impl Into<String>) {
    self.log.push(line.into());
    if self.log.len() > JOB_LOG_CAPACITY {
      self.log.remove(0);
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
  Queued,
  Connecting,
  Deploying,
  Tunnel,
  Done,
}
