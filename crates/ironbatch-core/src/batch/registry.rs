//! Artifact registry for runtime artifact lookup.
//!
//! A name-indexed registry of artifact factories, one table per artifact kind.
//! The kernel creates a fresh artifact instance for every step or partition
//! execution, passing the [`ArtifactContext`] it will run under.

use std::collections::HashMap;
use std::sync::Arc;

use super::artifact::{
    ArtifactContext, ArtifactError, Batchlet, Decider, ItemProcessor, ItemReader, ItemWriter,
    PartitionAnalyzer, PartitionCollector, PartitionMapper,
};
use super::checkpoint::CheckpointAlgorithm;
use super::retry::ItemFaultPolicy;

type Factory<T> = Arc<dyn Fn(&ArtifactContext) -> anyhow::Result<Box<T>> + Send + Sync>;

struct Factories<T: ?Sized> {
    kind: &'static str,
    entries: HashMap<String, Factory<T>>,
}

impl<T: ?Sized> Factories<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, name: String, factory: Factory<T>) {
        self.entries.insert(name, factory);
    }

    fn create(&self, name: &str, ctx: &ArtifactContext) -> Result<Box<T>, ArtifactError> {
        let factory = self.entries.get(name).ok_or_else(|| ArtifactError::NotFound {
            kind: self.kind,
            name: name.to_string(),
        })?;
        factory(ctx).map_err(|e| ArtifactError::Create {
            kind: self.kind,
            name: name.to_string(),
            source: e.into(),
        })
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// Registry of artifact factories, indexed by kind and name.
///
/// Registering a name that already exists for the same kind replaces it.
pub struct ArtifactRegistry {
    readers: Factories<dyn ItemReader>,
    processors: Factories<dyn ItemProcessor>,
    writers: Factories<dyn ItemWriter>,
    batchlets: Factories<dyn Batchlet>,
    deciders: Factories<dyn Decider>,
    checkpoint_algorithms: Factories<dyn CheckpointAlgorithm>,
    fault_policies: Factories<dyn ItemFaultPolicy>,
    mappers: Factories<dyn PartitionMapper>,
    collectors: Factories<dyn PartitionCollector>,
    analyzers: Factories<dyn PartitionAnalyzer>,
}

macro_rules! artifact_kind {
    ($table:ident, $register:ident, $create:ident, $has:ident, $trait:ident) => {
        pub fn $register<F, A>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
        where
            F: Fn(&ArtifactContext) -> anyhow::Result<A> + Send + Sync + 'static,
            A: $trait + 'static,
        {
            self.$table.insert(
                name.into(),
                Arc::new(move |ctx: &ArtifactContext| {
                    factory(ctx).map(|a| Box::new(a) as Box<dyn $trait>)
                }),
            );
            self
        }

        pub fn $create(
            &self,
            name: &str,
            ctx: &ArtifactContext,
        ) -> Result<Box<dyn $trait>, ArtifactError> {
            self.$table.create(name, ctx)
        }

        pub fn $has(&self, name: &str) -> bool {
            self.$table.contains(name)
        }
    };
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self {
            readers: Factories::new("reader"),
            processors: Factories::new("processor"),
            writers: Factories::new("writer"),
            batchlets: Factories::new("batchlet"),
            deciders: Factories::new("decider"),
            checkpoint_algorithms: Factories::new("checkpoint algorithm"),
            fault_policies: Factories::new("fault policy"),
            mappers: Factories::new("partition mapper"),
            collectors: Factories::new("partition collector"),
            analyzers: Factories::new("partition analyzer"),
        }
    }

    artifact_kind!(readers, register_reader, create_reader, has_reader, ItemReader);
    artifact_kind!(processors, register_processor, create_processor, has_processor, ItemProcessor);
    artifact_kind!(writers, register_writer, create_writer, has_writer, ItemWriter);
    artifact_kind!(batchlets, register_batchlet, create_batchlet, has_batchlet, Batchlet);
    artifact_kind!(deciders, register_decider, create_decider, has_decider, Decider);
    artifact_kind!(
        checkpoint_algorithms,
        register_checkpoint_algorithm,
        create_checkpoint_algorithm,
        has_checkpoint_algorithm,
        CheckpointAlgorithm
    );
    artifact_kind!(
        fault_policies,
        register_fault_policy,
        create_fault_policy,
        has_fault_policy,
        ItemFaultPolicy
    );
    artifact_kind!(mappers, register_mapper, create_mapper, has_mapper, PartitionMapper);
    artifact_kind!(
        collectors,
        register_collector,
        create_collector,
        has_collector,
        PartitionCollector
    );
    artifact_kind!(analyzers, register_analyzer, create_analyzer, has_analyzer, PartitionAnalyzer);
}

impl Default for ArtifactRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ArtifactRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRegistry")
            .field("readers", &self.readers.entries.len())
            .field("writers", &self.writers.entries.len())
            .field("batchlets", &self.batchlets.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::artifact::StepContext;
    use futures_util::future::{BoxFuture, FutureExt};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Echo(String);

    impl Batchlet for Echo {
        fn process(&mut self) -> BoxFuture<'_, anyhow::Result<String>> {
            let status = self.0.clone();
            async move { Ok(status) }.boxed()
        }
    }

    fn ctx() -> ArtifactContext {
        ArtifactContext {
            job_name: "job".to_string(),
            instance_id: Uuid::nil(),
            execution_id: Uuid::nil(),
            step_id: "step".to_string(),
            partition: None,
            job_parameters: HashMap::new(),
            properties: HashMap::from([("status".to_string(), "DONE".to_string())]),
            stop: CancellationToken::new(),
            step: StepContext::default(),
        }
    }

    #[tokio::test]
    async fn factory_sees_artifact_context() {
        let mut registry = ArtifactRegistry::new();
        registry.register_batchlet("echo", |ctx| {
            Ok(Echo(ctx.property("status").unwrap_or("NONE").to_string()))
        });

        assert!(registry.has_batchlet("echo"));
        let mut batchlet = registry.create_batchlet("echo", &ctx()).unwrap();
        assert_eq!(batchlet.process().await.unwrap(), "DONE");
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = ArtifactRegistry::new();
        let err = registry.create_reader("missing", &ctx()).err().unwrap();
        assert!(matches!(err, ArtifactError::NotFound { kind: "reader", .. }));
    }

    #[test]
    fn factory_failure_is_create_error() {
        let mut registry = ArtifactRegistry::new();
        registry.register_batchlet("broken", |_| -> anyhow::Result<Echo> {
            anyhow::bail!("no config")
        });
        let err = registry.create_batchlet("broken", &ctx()).err().unwrap();
        assert!(err.to_string().contains("no config"));
    }
}
