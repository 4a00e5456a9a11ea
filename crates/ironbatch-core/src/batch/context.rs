//! Services and per-execution state threaded through the kernel.

use std::collections::HashMap;
use std::sync::Arc;

use ironbatch_types::config::KernelConfig;
use ironbatch_types::model::JobModel;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::artifact::{ArtifactContext, StepContext};
use super::registry::ArtifactRegistry;
use super::transaction::TransactionManager;
use crate::event::EventBus;
use crate::repository::JobRepository;

// ---------------------------------------------------------------------------
// Model resolution
// ---------------------------------------------------------------------------

/// Maps a job name to its resolved model.
///
/// Resolution (parsing the definition language, substituting parameters into
/// property expressions) happens outside the kernel. `Ok(None)` means no job
/// of that name exists.
pub trait JobModelResolver: Send + Sync {
    fn resolve(
        &self,
        job_name: &str,
        parameters: &HashMap<String, String>,
    ) -> anyhow::Result<Option<JobModel>>;
}

/// Resolver over a fixed set of already-resolved models.
#[derive(Debug, Default)]
pub struct InMemoryModelResolver {
    models: HashMap<String, JobModel>,
}

impl InMemoryModelResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model under its own id. Replaces an existing model.
    pub fn insert(&mut self, model: JobModel) -> &mut Self {
        self.models.insert(model.id.clone(), model);
        self
    }
}

impl JobModelResolver for InMemoryModelResolver {
    fn resolve(
        &self,
        job_name: &str,
        _parameters: &HashMap<String, String>,
    ) -> anyhow::Result<Option<JobModel>> {
        Ok(self.models.get(job_name).cloned())
    }
}

// ---------------------------------------------------------------------------
// BatchContext
// ---------------------------------------------------------------------------

/// The kernel's external collaborators, shared by every controller.
pub struct BatchContext<R: JobRepository> {
    pub repo: Arc<R>,
    pub resolver: Arc<dyn JobModelResolver>,
    pub artifacts: Arc<ArtifactRegistry>,
    pub transactions: Arc<dyn TransactionManager>,
    pub events: EventBus,
    pub config: KernelConfig,
}

impl<R: JobRepository> BatchContext<R> {
    pub fn new(
        repo: Arc<R>,
        resolver: Arc<dyn JobModelResolver>,
        artifacts: Arc<ArtifactRegistry>,
        transactions: Arc<dyn TransactionManager>,
        config: KernelConfig,
    ) -> Self {
        Self {
            repo,
            resolver,
            artifacts,
            transactions,
            events: EventBus::new(config.event_bus_capacity),
            config,
        }
    }
}

impl<R: JobRepository> std::fmt::Debug for BatchContext<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchContext")
            .field("artifacts", &self.artifacts)
            .field("events", &self.events)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ExecutionScope
// ---------------------------------------------------------------------------

/// The execution view a controller or work unit runs under.
///
/// Partition and split-flow work units get a copy with their own child stop
/// token, and partitions additionally carry their partition index.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub job_name: String,
    pub instance_id: Uuid,
    pub execution_id: Uuid,
    pub parameters: HashMap<String, String>,
    pub job_properties: HashMap<String, String>,
    /// Whether this execution restarts an earlier failed or stopped one.
    pub restart: bool,
    pub stop: CancellationToken,
    pub partition_instance: Option<u32>,
}

impl ExecutionScope {
    /// Scope for one work unit: same execution, child stop token.
    pub fn child(&self, partition_instance: Option<u32>) -> Self {
        Self {
            stop: self.stop.child_token(),
            partition_instance,
            ..self.clone()
        }
    }

    /// Artifact context for one step, layering step then extra properties
    /// over the job properties.
    pub fn artifact_context(
        &self,
        step_id: &str,
        step_properties: &HashMap<String, String>,
        extra_properties: &HashMap<String, String>,
        step: StepContext,
    ) -> ArtifactContext {
        let mut properties = self.job_properties.clone();
        properties.extend(step_properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        properties.extend(extra_properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        ArtifactContext {
            job_name: self.job_name.clone(),
            instance_id: self.instance_id,
            execution_id: self.execution_id,
            step_id: step_id.to_string(),
            partition: self.partition_instance,
            job_parameters: self.parameters.clone(),
            properties,
            stop: self.stop.clone(),
            step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ExecutionScope {
        ExecutionScope {
            job_name: "job".to_string(),
            instance_id: Uuid::now_v7(),
            execution_id: Uuid::now_v7(),
            parameters: HashMap::new(),
            job_properties: HashMap::from([
                ("region".to_string(), "eu".to_string()),
                ("batch".to_string(), "10".to_string()),
            ]),
            restart: false,
            stop: CancellationToken::new(),
            partition_instance: None,
        }
    }

    #[test]
    fn artifact_properties_layer_over_job_properties() {
        let step_props = HashMap::from([("batch".to_string(), "50".to_string())]);
        let part_props = HashMap::from([("range".to_string(), "0-9".to_string())]);
        let ctx = scope().child(Some(2)).artifact_context(
            "load",
            &step_props,
            &part_props,
            StepContext::default(),
        );

        assert_eq!(ctx.property("region"), Some("eu"));
        assert_eq!(ctx.property("batch"), Some("50"));
        assert_eq!(ctx.property("range"), Some("0-9"));
        assert_eq!(ctx.partition, Some(2));
    }

    #[test]
    fn child_scope_is_stopped_with_parent() {
        let parent = scope();
        let child = parent.child(None);
        parent.stop.cancel();
        assert!(child.stop.is_cancelled());
    }

    #[test]
    fn in_memory_resolver_looks_up_by_id() {
        let mut resolver = InMemoryModelResolver::new();
        resolver.insert(JobModel {
            id: "nightly".to_string(),
            restartable: true,
            properties: HashMap::new(),
            elements: vec![],
        });
        assert!(resolver.resolve("nightly", &HashMap::new()).unwrap().is_some());
        assert!(resolver.resolve("weekly", &HashMap::new()).unwrap().is_none());
    }
}
