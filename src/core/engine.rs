use async_trait::async_trait;

use crate::core::types::{AffinityLabel, Entity, EntityKind, Link, ObjectRef, SearchQuery};
use crate::errors::EngineResult;

/// The engine calls label reconciliation is built from.
///
/// Implemented over REST by [`crate::core::RestEngine`] and in memory by
/// [`crate::core::MemoryEngine`]. Every call is a single round trip; nothing
/// is cached between calls.
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn list_affinity_labels(&self) -> EngineResult<Vec<AffinityLabel>>;

    async fn get_affinity_label(&self, id: &str) -> EngineResult<AffinityLabel>;

    async fn add_affinity_label(&self, name: &str) -> EngineResult<AffinityLabel>;

    async fn remove_affinity_label(&self, id: &str) -> EngineResult<()>;

    /// Links to the entities of `kind` currently carrying the label.
    async fn list_label_members(&self, label_id: &str, kind: EntityKind)
        -> EngineResult<Vec<Link>>;

    async fn get_entity(&self, kind: EntityKind, id: &str) -> EngineResult<Entity>;

    /// Follows a cluster link to the cluster's name.
    async fn get_cluster_name(&self, cluster: &Link) -> EngineResult<String>;

    async fn search_entities(
        &self,
        kind: EntityKind,
        query: &SearchQuery,
    ) -> EngineResult<Vec<Entity>>;

    async fn add_label_member(&self, label_id: &str, member: &ObjectRef) -> EngineResult<()>;

    async fn remove_label_member(
        &self,
        label_id: &str,
        kind: EntityKind,
        entity_id: &str,
    ) -> EngineResult<()>;

    /// Releases the session. A token the session obtained itself is revoked;
    /// one handed in by the caller stays valid.
    async fn close(&self) -> EngineResult<()>;

    /// Labels can't be searched server side, so this lists and matches by exact name.
    async fn find_affinity_label(&self, name: &str) -> EngineResult<Option<AffinityLabel>> {
        Ok(self
            .list_affinity_labels()
            .await?
            .into_iter()
            .find(|label| label.name == name))
    }
}
