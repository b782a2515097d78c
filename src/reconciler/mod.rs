/*
* Affinity Label Reconciler
* -------------------------
* @project: ovirt-affinity-labels
*
* Desired state in, engine calls out. One pass, no memory of previous runs:
* every membership is re-resolved from the engine by name (and cluster) each time.
*
*   ensure_present  -> find-or-create the label, then sync vms and hosts
*   ensure_absent   -> detach everything, then delete the label
*   sync_assignments-> diff current member names against desired names
*
* In check mode we walk exactly the same path but skip every mutating call,
* so `changed` comes out identical to a real run.
*/

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::core::{AffinityLabel, EngineApi, EntityKind, ObjectRef, SearchQuery};
use crate::errors::EngineResult;
use crate::module::{ModuleParams, State};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub changed: bool,
    /// Label as the engine sees it after the run, if it exists.
    pub label: Option<AffinityLabel>,
}

pub struct Reconciler<'a, E: EngineApi + ?Sized> {
    engine: &'a E,
    check_mode: bool,
}

impl<'a, E: EngineApi + ?Sized> Reconciler<'a, E> {
    pub fn new(engine: &'a E, check_mode: bool) -> Self {
        Self { engine, check_mode }
    }

    pub async fn ensure_present(
        &self,
        name: &str,
        cluster: Option<&str>,
        desired_vms: Option<&[String]>,
        desired_hosts: Option<&[String]>,
    ) -> EngineResult<Outcome> {
        let mut changed = false;
        let label = match self.engine.find_affinity_label(name).await? {
            Some(label) => {
                debug!(label = name, id = %label.id, "Affinity label exists");
                Some(label)
            }
            None => {
                changed = true;
                if self.check_mode {
                    info!(label = name, "Would create affinity label");
                    None
                } else {
                    let label = self.engine.add_affinity_label(name).await?;
                    info!(label = name, id = %label.id, "Created affinity label");
                    Some(label)
                }
            }
        };

        let label_id = label.as_ref().map(|l| l.id.clone());
        for (kind, desired) in [
            (EntityKind::Vms, desired_vms),
            (EntityKind::Hosts, desired_hosts),
        ] {
            changed |= self
                .sync_assignments(label_id.as_deref(), kind, desired, cluster)
                .await?;
        }

        let label = match label_id {
            Some(id) if changed && !self.check_mode => {
                Some(self.engine.get_affinity_label(&id).await?)
            }
            _ => label,
        };

        Ok(Outcome { changed, label })
    }

    pub async fn ensure_absent(&self, name: &str) -> EngineResult<Outcome> {
        let Some(label) = self.engine.find_affinity_label(name).await? else {
            debug!(label = name, "Affinity label already absent");
            return Ok(Outcome::default());
        };

        let cleared: &[String] = &[];
        for kind in EntityKind::ALL {
            self.sync_assignments(Some(&label.id), kind, Some(cleared), None)
                .await?;
        }

        if !self.check_mode {
            self.engine.remove_affinity_label(&label.id).await?;
        }
        info!(label = name, id = %label.id, check_mode = self.check_mode, "Removed affinity label");

        Ok(Outcome {
            changed: true,
            label: None,
        })
    }

    /// Makes the label's `kind` members (within `cluster_filter`) match `desired`.
    ///
    /// `label_id` is `None` only for a label that check mode pretended to create;
    /// it has no members and nothing can be attached to it.
    pub async fn sync_assignments(
        &self,
        label_id: Option<&str>,
        kind: EntityKind,
        desired: Option<&[String]>,
        cluster_filter: Option<&str>,
    ) -> EngineResult<bool> {
        let Some(desired) = desired else {
            return Ok(false);
        };

        let current = match label_id {
            Some(id) => self.current_assignments(id, kind, cluster_filter).await?,
            None => BTreeMap::new(),
        };
        let wanted: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
        let mut changed = false;

        for name in wanted.iter().filter(|name| !current.contains_key(**name)) {
            let query = SearchQuery::new(*name, cluster_filter);
            let matches = self.engine.search_entities(kind, &query).await?;
            // Same-named entities in one cluster: first match wins.
            let Some(entity) = matches.first() else {
                warn!(%kind, name, search = %query.expression(), "No entity matches, nothing to assign");
                continue;
            };

            if !self.check_mode {
                if let Some(label_id) = label_id {
                    self.engine
                        .add_label_member(label_id, &ObjectRef::new(kind, &entity.id))
                        .await?;
                }
            }
            info!(%kind, name, id = %entity.id, check_mode = self.check_mode, "Assigned affinity label");
            changed = true;
        }

        for (name, ids) in current.iter().filter(|(name, _)| !wanted.contains(name.as_str())) {
            if !self.check_mode {
                if let Some(label_id) = label_id {
                    for id in ids {
                        self.engine.remove_label_member(label_id, kind, id).await?;
                    }
                }
            }
            info!(%kind, name = %name, count = ids.len(), check_mode = self.check_mode, "Unassigned affinity label");
            changed = true;
        }

        Ok(changed)
    }

    // name -> ids of the label's members of `kind`, restricted to the filter cluster
    async fn current_assignments(
        &self,
        label_id: &str,
        kind: EntityKind,
        cluster_filter: Option<&str>,
    ) -> EngineResult<BTreeMap<String, Vec<String>>> {
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for link in self.engine.list_label_members(label_id, kind).await? {
            let entity = self.engine.get_entity(kind, &link.id).await?;
            let in_scope = match (cluster_filter, &entity.cluster) {
                (None, _) => true,
                (Some(wanted), Some(cluster)) => self.engine.get_cluster_name(cluster).await? == wanted,
                (Some(_), None) => false,
            };
            if in_scope {
                by_name.entry(entity.name).or_default().push(entity.id);
            } else {
                debug!(%kind, name = %entity.name, "Member outside cluster filter, ignored");
            }
        }

        Ok(by_name)
    }
}

/// Dispatches validated parameters to the matching reconciliation.
pub async fn execute<E>(engine: &E, params: &ModuleParams) -> crate::errors::LabelResult<Outcome>
where
    E: EngineApi + ?Sized,
{
    params.validate()?;
    let reconciler = Reconciler::new(engine, params.check_mode);

    let outcome = match params.state {
        State::Present => {
            reconciler
                .ensure_present(
                    &params.name,
                    params.cluster.as_deref(),
                    params.vms.as_deref(),
                    params.hosts.as_deref(),
                )
                .await?
        }
        State::Absent => reconciler.ensure_absent(&params.name).await?,
    };

    Ok(outcome)
}
