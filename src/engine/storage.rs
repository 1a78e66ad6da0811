// Storage abstraction for definitions and workflow instances

//! # Storage Abstraction Layer
//!
//! The engine persists every instance mutation through this layer so a
//! restarted engine can reload non-terminal instances and resume them.
//! The abstraction separates orchestration logic from storage details.
//!
//! ## Storage Architecture
//!
//! - **WorkflowStorage trait**: the interface all backends implement
//! - **InMemoryWorkflowStorage**: default implementation for
//!   development, testing, and single-process deployments
//!
//! All operations are async and thread-safe; multiple engine tasks write
//! their instances concurrently.

use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{WorkflowDefinition, WorkflowInstance};
use crate::Result;

/// Storage trait for definition and instance persistence
#[async_trait::async_trait]
pub trait WorkflowStorage: Send + Sync {
    /// Store a published workflow definition
    ///
    /// Definitions are immutable; storing the same (id, version) twice
    /// replaces an identical document, never mutates a live one.
    async fn create_definition(&self, definition: WorkflowDefinition)
        -> Result<WorkflowDefinition>;

    /// Get a definition by id and version
    async fn get_definition(&self, id: &str, version: u32) -> Result<Option<WorkflowDefinition>>;

    /// List all stored definitions
    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Persist a new workflow instance
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance>;

    /// Get an instance snapshot by id
    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>>;

    /// Replace the stored instance with a newer snapshot
    async fn update_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance>;

    /// List instances, optionally filtered by definition id
    async fn list_instances(&self, definition_id: Option<&str>) -> Result<Vec<WorkflowInstance>>;

    /// Instances that have not reached a terminal state, for restart
    /// recovery
    async fn list_inflight_instances(&self) -> Result<Vec<WorkflowInstance>>;
}

/// In-memory storage implementation for development and testing
///
/// Not persistent across process restarts and bounded by available
/// memory; production deployments plug a durable backend into the same
/// trait.
#[derive(Default)]
pub struct InMemoryWorkflowStorage {
    definitions: std::sync::RwLock<HashMap<(String, u32), WorkflowDefinition>>,
    instances: std::sync::RwLock<HashMap<Uuid, WorkflowInstance>>,
}

#[async_trait::async_trait]
impl WorkflowStorage for InMemoryWorkflowStorage {
    async fn create_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        let mut definitions = self.definitions.write().unwrap();
        definitions.insert(
            (definition.id.clone(), definition.version),
            definition.clone(),
        );
        Ok(definition)
    }

    async fn get_definition(&self, id: &str, version: u32) -> Result<Option<WorkflowDefinition>> {
        let definitions = self.definitions.read().unwrap();
        Ok(definitions.get(&(id.to_string(), version)).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let definitions = self.definitions.read().unwrap();
        Ok(definitions.values().cloned().collect())
    }

    async fn create_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance> {
        let mut instances = self.instances.write().unwrap();
        instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>> {
        let instances = self.instances.read().unwrap();
        Ok(instances.get(id).cloned())
    }

    async fn update_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance> {
        let mut instances = self.instances.write().unwrap();
        instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn list_instances(&self, definition_id: Option<&str>) -> Result<Vec<WorkflowInstance>> {
        let instances = self.instances.read().unwrap();
        Ok(instances
            .values()
            .filter(|instance| {
                definition_id.map_or(true, |id| instance.definition_id == id)
            })
            .cloned()
            .collect())
    }

    async fn list_inflight_instances(&self) -> Result<Vec<WorkflowInstance>> {
        let instances = self.instances.read().unwrap();
        Ok(instances
            .values()
            .filter(|instance| !instance.status.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentRef, InstanceStatus, Step};
    use serde_json::json;

    fn create_test_definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "checkout",
            "Checkout",
            vec![Step::agent_call(
                "reserve",
                AgentRef::new("inventory", "v1"),
                "reserve",
            )],
        )
    }

    #[tokio::test]
    async fn test_definition_roundtrip() {
        let storage = InMemoryWorkflowStorage::default();
        storage
            .create_definition(create_test_definition())
            .await
            .unwrap();

        let loaded = storage.get_definition("checkout", 1).await.unwrap();
        assert!(loaded.is_some());
        assert!(storage.get_definition("checkout", 2).await.unwrap().is_none());
        assert_eq!(storage.list_definitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let storage = InMemoryWorkflowStorage::default();
        let definition = create_test_definition();
        let mut instance = WorkflowInstance::new(&definition, json!({}));
        let id = instance.id;

        storage.create_instance(instance.clone()).await.unwrap();
        assert_eq!(storage.list_inflight_instances().await.unwrap().len(), 1);

        instance.set_status(InstanceStatus::Running, None);
        instance.set_status(InstanceStatus::Completed, None);
        storage.update_instance(instance).await.unwrap();

        let loaded = storage.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Completed);
        assert!(storage.list_inflight_instances().await.unwrap().is_empty());
        assert_eq!(
            storage.list_instances(Some("checkout")).await.unwrap().len(),
            1
        );
        assert!(storage.list_instances(Some("other")).await.unwrap().is_empty());
    }
}
