//! Resolved job model.
//!
//! The job definition language is parsed (and its property expressions
//! substituted) by an external model-resolution service; the kernel only ever
//! sees this already-resolved tree. Every node of the tree is one variant of
//! [`ExecutionElement`], and the transition behavior shared by all of them is
//! exposed through accessor methods rather than a type hierarchy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::partition::PartitionPlan;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A resolved job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobModel {
    /// Job id (also the job name used for instance lookup).
    pub id: String,
    /// Whether failed or stopped executions of this job may be restarted.
    #[serde(default = "default_true")]
    pub restartable: bool,
    /// Job-level properties visible to every artifact.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
    /// Top-level execution elements; the first one runs first.
    pub elements: Vec<ExecutionElement>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Execution elements
// ---------------------------------------------------------------------------

/// One node of the job graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionElement {
    Step(StepModel),
    Flow(FlowModel),
    Split(SplitModel),
    Decision(DecisionModel),
}

impl ExecutionElement {
    pub fn id(&self) -> &str {
        match self {
            ExecutionElement::Step(s) => &s.id,
            ExecutionElement::Flow(f) => &f.id,
            ExecutionElement::Split(s) => &s.id,
            ExecutionElement::Decision(d) => &d.id,
        }
    }

    /// The `next` attribute, if declared. Decisions only transition by rule.
    pub fn next(&self) -> Option<&str> {
        match self {
            ExecutionElement::Step(s) => s.next.as_deref(),
            ExecutionElement::Flow(f) => f.next.as_deref(),
            ExecutionElement::Split(s) => s.next.as_deref(),
            ExecutionElement::Decision(_) => None,
        }
    }

    /// Ordered transition rules. Splits never carry any.
    pub fn transitions(&self) -> &[Transition] {
        match self {
            ExecutionElement::Step(s) => &s.transitions,
            ExecutionElement::Flow(f) => &f.transitions,
            ExecutionElement::Split(_) => &[],
            ExecutionElement::Decision(d) => &d.transitions,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ExecutionElement::Step(_) => "step",
            ExecutionElement::Flow(_) => "flow",
            ExecutionElement::Split(_) => "split",
            ExecutionElement::Decision(_) => "decision",
        }
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// A transition rule: when the element's exit status matches `on`, take `action`.
///
/// `on` is either an exact exit status or a pattern using `*` (any run of
/// characters) and `?` (exactly one character).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub on: String,
    pub action: TransitionAction,
}

impl Transition {
    pub fn next(on: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            on: on.into(),
            action: TransitionAction::Next { to: to.into() },
        }
    }

    pub fn end(on: impl Into<String>, exit_status: Option<&str>) -> Self {
        Self {
            on: on.into(),
            action: TransitionAction::End {
                exit_status: exit_status.map(String::from),
            },
        }
    }

    pub fn fail(on: impl Into<String>, exit_status: Option<&str>) -> Self {
        Self {
            on: on.into(),
            action: TransitionAction::Fail {
                exit_status: exit_status.map(String::from),
            },
        }
    }

    pub fn stop(on: impl Into<String>, exit_status: Option<&str>, restart: Option<&str>) -> Self {
        Self {
            on: on.into(),
            action: TransitionAction::Stop {
                exit_status: exit_status.map(String::from),
                restart: restart.map(String::from),
            },
        }
    }
}

/// What a matched transition does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionAction {
    /// Continue with the sibling element `to`.
    Next { to: String },
    /// End the job as COMPLETED.
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
    /// End the job as FAILED.
    Fail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
    /// End the job as STOPPED, optionally naming where a restart resumes.
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restart: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepModel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
    /// Maximum number of starts across executions of an instance (0 = unlimited).
    #[serde(default)]
    pub start_limit: u32,
    /// Re-run the step on restart even if it already completed.
    #[serde(default)]
    pub allow_start_if_complete: bool,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionModel>,
}

impl StepModel {
    /// A batchlet step with no transitions.
    pub fn batchlet(id: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            StepKind::Batchlet {
                artifact: artifact.into(),
            },
        )
    }

    /// A chunk step with no transitions.
    pub fn chunk(id: impl Into<String>, chunk: ChunkModel) -> Self {
        Self::with_kind(id, StepKind::Chunk(chunk))
    }

    fn with_kind(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            next: None,
            transitions: Vec::new(),
            properties: HashMap::new(),
            start_limit: 0,
            allow_start_if_complete: false,
            kind,
            partition: None,
        }
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn on(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn partitioned(mut self, partition: PartitionModel) -> Self {
        self.partition = Some(partition);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// A single task-oriented artifact invocation.
    Batchlet { artifact: String },
    /// Read/process/write loop with periodic checkpointing.
    Chunk(ChunkModel),
}

/// Chunk-oriented processing declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkModel {
    pub reader: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
    pub writer: String,
    #[serde(default)]
    pub checkpoint: CheckpointPolicy,
    /// Items that may be skipped per step execution (None = no skipping).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_limit: Option<u32>,
    /// Retries allowed per step execution (None = no retrying).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    /// Named custom fault policy; overrides the limit-based default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_policy: Option<String>,
}

impl ChunkModel {
    pub fn new(reader: impl Into<String>, writer: impl Into<String>) -> Self {
        Self {
            reader: reader.into(),
            processor: None,
            writer: writer.into(),
            checkpoint: CheckpointPolicy::default(),
            skip_limit: None,
            retry_limit: None,
            fault_policy: None,
        }
    }

    pub fn processor(mut self, processor: impl Into<String>) -> Self {
        self.processor = Some(processor.into());
        self
    }

    pub fn item_count(mut self, item_count: u32) -> Self {
        self.checkpoint = CheckpointPolicy::Item {
            item_count,
            time_limit_secs: None,
        };
        self
    }
}

/// How checkpoint boundaries are chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Commit every `item_count` items (or after `time_limit_secs`, whichever is first).
    Item {
        item_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_limit_secs: Option<u64>,
    },
    /// A named checkpoint algorithm artifact.
    Custom { algorithm: String },
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy::Item {
            item_count: 10,
            time_limit_secs: None,
        }
    }
}

/// Partitioning declaration for a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionModel {
    /// Static plan; ignored when a mapper is declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PartitionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapper: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,
}

// ---------------------------------------------------------------------------
// Flow / Split / Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowModel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    /// Id of the element that runs first (defaults to the first in `elements`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    pub elements: Vec<ExecutionElement>,
}

impl FlowModel {
    pub fn new(id: impl Into<String>, elements: Vec<ExecutionElement>) -> Self {
        Self {
            id: id.into(),
            next: None,
            transitions: Vec::new(),
            first: None,
            elements,
        }
    }
}

/// Flows that execute concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitModel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub flows: Vec<FlowModel>,
}

/// A decider artifact chooses an exit status that drives the transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionModel {
    pub id: String,
    pub decider: String,
    pub transitions: Vec<Transition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn element_accessors_share_transition_behavior() {
        let step = ExecutionElement::Step(
            StepModel::batchlet("s1", "noop")
                .then("s2")
                .on(Transition::end("DONE", None)),
        );
        assert_eq!(step.id(), "s1");
        assert_eq!(step.next(), Some("s2"));
        assert_eq!(step.transitions().len(), 1);

        let split = ExecutionElement::Split(SplitModel {
            id: "sp".to_string(),
            next: Some("after".to_string()),
            flows: vec![],
        });
        assert!(split.transitions().is_empty());
        assert_eq!(split.kind_name(), "split");
    }

    #[test]
    fn job_model_deserializes_from_resolved_json() {
        let value = json!({
            "id": "nightly",
            "elements": [
                {
                    "type": "step",
                    "id": "extract",
                    "next": "route",
                    "kind": {
                        "type": "chunk",
                        "reader": "csv-reader",
                        "writer": "db-writer",
                        "checkpoint": { "type": "item", "item_count": 3 }
                    }
                },
                {
                    "type": "decision",
                    "id": "route",
                    "decider": "router",
                    "transitions": [
                        { "on": "SKIP*", "action": { "type": "end" } },
                        { "on": "*", "action": { "type": "stop", "restart": "extract" } }
                    ]
                }
            ]
        });

        let job: JobModel = serde_json::from_value(value).unwrap();
        assert!(job.restartable, "restartable defaults to true");
        assert_eq!(job.elements.len(), 2);
        match &job.elements[0] {
            ExecutionElement::Step(step) => match &step.kind {
                StepKind::Chunk(chunk) => {
                    assert_eq!(
                        chunk.checkpoint,
                        CheckpointPolicy::Item {
                            item_count: 3,
                            time_limit_secs: None
                        }
                    );
                }
                other => panic!("expected chunk, got {other:?}"),
            },
            other => panic!("expected step, got {other:?}"),
        }
        assert_eq!(
            job.elements[1].transitions()[1].action,
            TransitionAction::Stop {
                exit_status: None,
                restart: Some("extract".to_string())
            }
        );
    }
}
