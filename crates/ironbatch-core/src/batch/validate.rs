//! Definition checks run before a job is started or restarted.
//!
//! Each sibling list (the job's top level and every flow body) is modelled as
//! a `petgraph` directed graph whose edges are the `next` attribute and the
//! `Next` transition targets. A topological sort rejects loops.

use std::collections::{HashMap, HashSet};

use ironbatch_types::model::{
    CheckpointPolicy, ExecutionElement, JobModel, StepKind, StepModel, TransitionAction,
};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("job '{0}' has no elements")]
    EmptyJob(String),

    #[error("flow '{0}' has no elements")]
    EmptyFlow(String),

    #[error("split '{0}' has no flows")]
    EmptySplit(String),

    #[error("element ids must not be empty")]
    EmptyId,

    #[error("duplicate element id '{0}'")]
    DuplicateId(String),

    #[error("element '{from}' references unknown element '{target}'")]
    UnknownTarget { from: String, target: String },

    #[error("flow '{flow}' names unknown first element '{first}'")]
    UnknownFirst { flow: String, first: String },

    #[error("cycle detected involving element '{0}'")]
    Cycle(String),

    #[error("chunk step '{0}' must checkpoint after at least one item")]
    InvalidItemCount(String),

    #[error("partitioned step '{0}' needs a plan with partitions or a mapper")]
    MissingPartitionPlan(String),
}

/// Check a resolved job model for structural errors.
pub fn validate_job(job: &JobModel) -> Result<(), ModelError> {
    if job.elements.is_empty() {
        return Err(ModelError::EmptyJob(job.id.clone()));
    }
    let mut seen = HashSet::new();
    validate_elements(&job.elements, &mut seen)
}

fn validate_elements<'a>(
    elements: &'a [ExecutionElement],
    seen: &mut HashSet<&'a str>,
) -> Result<(), ModelError> {
    for element in elements {
        let id = element.id();
        if id.is_empty() {
            return Err(ModelError::EmptyId);
        }
        if !seen.insert(id) {
            return Err(ModelError::DuplicateId(id.to_string()));
        }

        match element {
            ExecutionElement::Step(step) => validate_step(step)?,
            ExecutionElement::Flow(flow) => {
                if flow.elements.is_empty() {
                    return Err(ModelError::EmptyFlow(flow.id.clone()));
                }
                if let Some(first) = &flow.first {
                    if !flow.elements.iter().any(|e| e.id() == first) {
                        return Err(ModelError::UnknownFirst {
                            flow: flow.id.clone(),
                            first: first.clone(),
                        });
                    }
                }
                validate_elements(&flow.elements, seen)?;
            }
            ExecutionElement::Split(split) => {
                if split.flows.is_empty() {
                    return Err(ModelError::EmptySplit(split.id.clone()));
                }
                for flow in &split.flows {
                    if !seen.insert(flow.id.as_str()) {
                        return Err(ModelError::DuplicateId(flow.id.clone()));
                    }
                    if flow.elements.is_empty() {
                        return Err(ModelError::EmptyFlow(flow.id.clone()));
                    }
                    validate_elements(&flow.elements, seen)?;
                }
            }
            ExecutionElement::Decision(_) => {}
        }
    }

    validate_transitions(elements)
}

fn validate_step(step: &StepModel) -> Result<(), ModelError> {
    if let StepKind::Chunk(chunk) = &step.kind {
        if matches!(chunk.checkpoint, CheckpointPolicy::Item { item_count: 0, .. }) {
            return Err(ModelError::InvalidItemCount(step.id.clone()));
        }
    }
    if let Some(partition) = &step.partition {
        let has_plan = partition.plan.as_ref().is_some_and(|p| p.partitions > 0);
        if !has_plan && partition.mapper.is_none() {
            return Err(ModelError::MissingPartitionPlan(step.id.clone()));
        }
    }
    Ok(())
}

/// Every target must be a sibling, and sibling transitions must not loop.
fn validate_transitions(elements: &[ExecutionElement]) -> Result<(), ModelError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, _> = elements
        .iter()
        .map(|e| (e.id(), graph.add_node(e.id())))
        .collect();

    for element in elements {
        let from = index[element.id()];
        let targets = element
            .next()
            .into_iter()
            .chain(element.transitions().iter().filter_map(|t| match &t.action {
                TransitionAction::Next { to } => Some(to.as_str()),
                TransitionAction::Stop {
                    restart: Some(to), ..
                } => Some(to.as_str()),
                _ => None,
            }));

        for target in targets {
            let to = index.get(target).ok_or_else(|| ModelError::UnknownTarget {
                from: element.id().to_string(),
                target: target.to_string(),
            })?;
            // A stop-and-restart target is not a control-flow edge.
            let is_next_edge = element.next() == Some(target)
                || element.transitions().iter().any(|t| {
                    matches!(&t.action, TransitionAction::Next { to } if to == target)
                });
            if is_next_edge {
                graph.add_edge(from, *to, ());
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| ModelError::Cycle(graph[cycle.node_id()].to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironbatch_types::model::{ChunkModel, FlowModel, PartitionModel, SplitModel, Transition};
    use ironbatch_types::partition::PartitionPlan;
    use std::collections::HashMap;

    fn job(elements: Vec<ExecutionElement>) -> JobModel {
        JobModel {
            id: "job".to_string(),
            restartable: true,
            properties: HashMap::new(),
            elements,
        }
    }

    fn step(id: &str) -> StepModel {
        StepModel::batchlet(id, "noop")
    }

    #[test]
    fn valid_linear_job() {
        let model = job(vec![
            ExecutionElement::Step(step("a").then("b")),
            ExecutionElement::Step(step("b")),
        ]);
        assert_eq!(validate_job(&model), Ok(()));
    }

    #[test]
    fn rejects_cycle() {
        let model = job(vec![
            ExecutionElement::Step(step("a").then("b")),
            ExecutionElement::Step(step("b").on(Transition::next("*", "a"))),
        ]);
        assert!(matches!(validate_job(&model), Err(ModelError::Cycle(_))));
    }

    #[test]
    fn restart_target_is_not_a_cycle() {
        let model = job(vec![
            ExecutionElement::Step(step("a").then("b")),
            ExecutionElement::Step(step("b").on(Transition::stop("*", None, Some("a")))),
        ]);
        assert_eq!(validate_job(&model), Ok(()));
    }

    #[test]
    fn rejects_unknown_target() {
        let model = job(vec![ExecutionElement::Step(step("a").then("nowhere"))]);
        assert_eq!(
            validate_job(&model),
            Err(ModelError::UnknownTarget {
                from: "a".to_string(),
                target: "nowhere".to_string()
            })
        );
    }

    #[test]
    fn target_outside_sibling_list_is_unknown() {
        let inner = FlowModel::new("f", vec![ExecutionElement::Step(step("inner").then("outer"))]);
        let model = job(vec![
            ExecutionElement::Flow(inner),
            ExecutionElement::Step(step("outer")),
        ]);
        assert!(matches!(
            validate_job(&model),
            Err(ModelError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_ids_across_nesting() {
        let flow = FlowModel::new("f", vec![ExecutionElement::Step(step("a"))]);
        let model = job(vec![
            ExecutionElement::Step(step("a").then("f")),
            ExecutionElement::Flow(flow),
        ]);
        assert_eq!(validate_job(&model), Err(ModelError::DuplicateId("a".to_string())));
    }

    #[test]
    fn rejects_empty_split_and_zero_item_count() {
        let split = job(vec![ExecutionElement::Split(SplitModel {
            id: "s".to_string(),
            next: None,
            flows: vec![],
        })]);
        assert_eq!(validate_job(&split), Err(ModelError::EmptySplit("s".to_string())));

        let chunk = job(vec![ExecutionElement::Step(StepModel::chunk(
            "c",
            ChunkModel::new("r", "w").item_count(0),
        ))]);
        assert_eq!(
            validate_job(&chunk),
            Err(ModelError::InvalidItemCount("c".to_string()))
        );
    }

    #[test]
    fn partitioned_step_needs_plan_or_mapper() {
        let bare = job(vec![ExecutionElement::Step(
            step("p").partitioned(PartitionModel::default()),
        )]);
        assert_eq!(
            validate_job(&bare),
            Err(ModelError::MissingPartitionPlan("p".to_string()))
        );

        let planned = job(vec![ExecutionElement::Step(step("p").partitioned(
            PartitionModel {
                plan: Some(PartitionPlan::new(3)),
                ..Default::default()
            },
        ))]);
        assert_eq!(validate_job(&planned), Ok(()));
    }

    #[test]
    fn flow_first_must_exist() {
        let mut flow = FlowModel::new("f", vec![ExecutionElement::Step(step("a"))]);
        flow.first = Some("b".to_string());
        assert!(matches!(
            validate_job(&job(vec![ExecutionElement::Flow(flow)])),
            Err(ModelError::UnknownFirst { .. })
        ));
    }
}
