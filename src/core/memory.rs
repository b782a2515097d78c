use async_trait::async_trait;
use serde_json::Map;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use crate::core::engine::EngineApi;
use crate::core::types::{AffinityLabel, Entity, EntityKind, Link, ObjectRef, SearchQuery};
use crate::errors::{EngineError, EngineResult, ObjectKind};
use crate::AsyncMutex;

/// Every state-changing call the engine received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    AddLabel { name: String },
    RemoveLabel { id: String },
    AddMember { label_id: String, kind: EntityKind, entity_id: String },
    RemoveMember { label_id: String, kind: EntityKind, entity_id: String },
}

#[derive(Debug, Default)]
struct LabelRecord {
    name: String,
    vms: Vec<String>,
    hosts: Vec<String>,
}

impl LabelRecord {
    fn members(&self, kind: EntityKind) -> &Vec<String> {
        match kind {
            EntityKind::Vms => &self.vms,
            EntityKind::Hosts => &self.hosts,
        }
    }

    fn members_mut(&mut self, kind: EntityKind) -> &mut Vec<String> {
        match kind {
            EntityKind::Vms => &mut self.vms,
            EntityKind::Hosts => &mut self.hosts,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    // id -> name
    clusters: BTreeMap<String, String>,
    vms: Vec<Entity>,
    hosts: Vec<Entity>,
    labels: BTreeMap<String, LabelRecord>,
    mutations: Vec<Mutation>,
    fail_mutations: Option<String>,
    closed: bool,
}

impl EngineState {
    fn entities(&self, kind: EntityKind) -> &Vec<Entity> {
        match kind {
            EntityKind::Vms => &self.vms,
            EntityKind::Hosts => &self.hosts,
        }
    }

    fn label(&self, id: &str) -> EngineResult<&LabelRecord> {
        self.labels.get(id).ok_or_else(|| not_found(ObjectKind::AffinityLabel, id))
    }

    fn label_mut(&mut self, id: &str) -> EngineResult<&mut LabelRecord> {
        self.labels
            .get_mut(id)
            .ok_or_else(|| not_found(ObjectKind::AffinityLabel, id))
    }

    fn check_writable(&self) -> EngineResult<()> {
        match &self.fail_mutations {
            Some(reason) => Err(EngineError::Fault {
                status: 409,
                reason: reason.clone(),
                detail: None,
            }),
            None => Ok(()),
        }
    }

    fn snapshot(&self, id: &str) -> EngineResult<AffinityLabel> {
        let record = self.label(id)?;
        Ok(AffinityLabel {
            id: id.to_string(),
            name: record.name.clone(),
            href: Some(format!("/ovirt-engine/api/affinitylabels/{id}")),
            attributes: Map::new(),
        })
    }
}

fn not_found(kind: ObjectKind, id: &str) -> EngineError {
    EngineError::NotFound {
        kind,
        id: id.to_string(),
    }
}

/// An engine that lives in memory. Handy for tests and dry runs of playbooks.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: AsyncMutex<EngineState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_cluster(&self, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.state.lock().await.clusters.insert(id.clone(), name.to_string());
        id
    }

    /// Registers a VM, creating its cluster on first mention.
    pub async fn add_vm(&self, name: &str, cluster: Option<&str>) -> String {
        self.add_entity(EntityKind::Vms, name, cluster).await
    }

    pub async fn add_host(&self, name: &str, cluster: Option<&str>) -> String {
        self.add_entity(EntityKind::Hosts, name, cluster).await
    }

    async fn add_entity(&self, kind: EntityKind, name: &str, cluster: Option<&str>) -> String {
        let mut state = self.state.lock().await;
        let cluster = cluster.map(|cluster_name| {
            let existing = state
                .clusters
                .iter()
                .find(|(_, n)| n.as_str() == cluster_name)
                .map(|(id, _)| id.clone());
            let id = existing.unwrap_or_else(|| {
                let id = Uuid::new_v4().to_string();
                state.clusters.insert(id.clone(), cluster_name.to_string());
                id
            });
            Link {
                href: Some(format!("/ovirt-engine/api/clusters/{id}")),
                id,
            }
        });

        let id = Uuid::new_v4().to_string();
        let entity = Entity {
            id: id.clone(),
            name: name.to_string(),
            cluster,
        };
        match kind {
            EntityKind::Vms => state.vms.push(entity),
            EntityKind::Hosts => state.hosts.push(entity),
        }
        id
    }

    /// Seeds a label directly, bypassing the mutation log.
    pub async fn seed_label(&self, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.state.lock().await.labels.insert(
            id.clone(),
            LabelRecord {
                name: name.to_string(),
                ..Default::default()
            },
        );
        id
    }

    /// Seeds a membership directly, bypassing the mutation log.
    pub async fn seed_member(&self, label_id: &str, kind: EntityKind, entity_id: &str) {
        if let Some(record) = self.state.lock().await.labels.get_mut(label_id) {
            record.members_mut(kind).push(entity_id.to_string());
        }
    }

    /// Makes every later mutating call fail with an engine fault.
    pub async fn fail_mutations(&self, reason: &str) {
        self.state.lock().await.fail_mutations = Some(reason.to_string());
    }

    pub async fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().await.mutations.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn label_id(&self, name: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .labels
            .iter()
            .find(|(_, record)| record.name == name)
            .map(|(id, _)| id.clone())
    }

    /// Sorted names of the label's members of `kind`, optionally within one cluster.
    pub async fn member_names(&self, label: &str, kind: EntityKind, cluster: Option<&str>) -> Vec<String> {
        let state = self.state.lock().await;
        let Some(record) = state.labels.values().find(|record| record.name == label) else {
            return Vec::new();
        };

        let mut names: Vec<String> = record
            .members(kind)
            .iter()
            .filter_map(|id| state.entities(kind).iter().find(|e| &e.id == id))
            .filter(|entity| match cluster {
                None => true,
                Some(wanted) => entity
                    .cluster
                    .as_ref()
                    .and_then(|link| state.clusters.get(&link.id))
                    .is_some_and(|name| name == wanted),
            })
            .map(|entity| entity.name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl EngineApi for MemoryEngine {
    async fn list_affinity_labels(&self) -> EngineResult<Vec<AffinityLabel>> {
        let state = self.state.lock().await;
        state.labels.keys().map(|id| state.snapshot(id)).collect()
    }

    async fn get_affinity_label(&self, id: &str) -> EngineResult<AffinityLabel> {
        self.state.lock().await.snapshot(id)
    }

    async fn add_affinity_label(&self, name: &str) -> EngineResult<AffinityLabel> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        if state.labels.values().any(|record| record.name == name) {
            return Err(EngineError::Fault {
                status: 409,
                reason: "Operation Failed".to_string(),
                detail: Some(format!("[Affinity label name {name} is already in use]")),
            });
        }

        let id = Uuid::new_v4().to_string();
        state.labels.insert(
            id.clone(),
            LabelRecord {
                name: name.to_string(),
                ..Default::default()
            },
        );
        state.mutations.push(Mutation::AddLabel {
            name: name.to_string(),
        });
        state.snapshot(&id)
    }

    async fn remove_affinity_label(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        state
            .labels
            .remove(id)
            .ok_or_else(|| not_found(ObjectKind::AffinityLabel, id))?;
        state.mutations.push(Mutation::RemoveLabel { id: id.to_string() });
        Ok(())
    }

    async fn list_label_members(&self, label_id: &str, kind: EntityKind) -> EngineResult<Vec<Link>> {
        let state = self.state.lock().await;
        let record = state.label(label_id)?;
        Ok(record
            .members(kind)
            .iter()
            .map(|id| Link {
                id: id.clone(),
                href: Some(format!("/ovirt-engine/api/{}/{id}", kind.collection())),
            })
            .collect())
    }

    async fn get_entity(&self, kind: EntityKind, id: &str) -> EngineResult<Entity> {
        let state = self.state.lock().await;
        state
            .entities(kind)
            .iter()
            .find(|entity| entity.id == id)
            .cloned()
            .ok_or_else(|| not_found(kind.spec().object, id))
    }

    async fn get_cluster_name(&self, cluster: &Link) -> EngineResult<String> {
        let state = self.state.lock().await;
        state
            .clusters
            .get(&cluster.id)
            .cloned()
            .ok_or_else(|| not_found(ObjectKind::Cluster, &cluster.id))
    }

    async fn search_entities(&self, kind: EntityKind, query: &SearchQuery) -> EngineResult<Vec<Entity>> {
        let state = self.state.lock().await;
        debug!(%kind, search = %query.expression(), "In-memory search");
        Ok(state
            .entities(kind)
            .iter()
            .filter(|entity| entity.name == query.name)
            .filter(|entity| match &query.cluster {
                None => true,
                Some(wanted) => entity
                    .cluster
                    .as_ref()
                    .and_then(|link| state.clusters.get(&link.id))
                    .is_some_and(|name| name == wanted),
            })
            .cloned()
            .collect())
    }

    async fn add_label_member(&self, label_id: &str, member: &ObjectRef) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        let kind = member.kind();
        if !state.entities(kind).iter().any(|entity| entity.id == member.id()) {
            return Err(not_found(kind.spec().object, member.id()));
        }
        let members = state.label_mut(label_id)?.members_mut(kind);
        if !members.iter().any(|id| id == member.id()) {
            members.push(member.id().to_string());
        }
        state.mutations.push(Mutation::AddMember {
            label_id: label_id.to_string(),
            kind,
            entity_id: member.id().to_string(),
        });
        Ok(())
    }

    async fn remove_label_member(&self, label_id: &str, kind: EntityKind, entity_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        let members = state.label_mut(label_id)?.members_mut(kind);
        let before = members.len();
        members.retain(|id| id != entity_id);
        if members.len() == before {
            return Err(not_found(kind.spec().object, entity_id));
        }
        state.mutations.push(Mutation::RemoveMember {
            label_id: label_id.to_string(),
            kind,
            entity_id: entity_id.to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}
