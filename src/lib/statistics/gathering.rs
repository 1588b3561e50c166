use std::{collections::HashSet, sync::Arc};

use tracing::*;

use crate::{
    error::{GatherError, StoreError, TranslateError},
    protocol::{MultipartReply, MultipartRequest},
    registry::{FlowId, FlowRegistryKey},
    statistics::{
        StatisticsCategory, StatisticsContext,
        snapshot::{SnapshotBody, StatisticsSnapshot},
    },
    store::{ItemKey, StatisticsWrite},
};

/// Registry updates to apply once the write went through.
enum Commit {
    Flows {
        fresh: Vec<(FlowRegistryKey, FlowId)>,
        stale: Vec<FlowRegistryKey>,
    },
    Groups {
        fresh: Vec<u32>,
        stale: Vec<u32>,
    },
    Meters {
        fresh: Vec<u32>,
        stale: Vec<u32>,
    },
    Observed(HashSet<ItemKey>),
}

impl StatisticsContext {
    /// Requests, translates and writes one category. Returns the number of entries written.
    #[instrument(level = "debug", skip(self), fields(dpid = %self.datapath_id()))]
    pub(super) async fn gather_category(
        &self,
        category: StatisticsCategory,
        initial: bool,
    ) -> Result<usize, GatherError> {
        let writer = self
            .store
            .lookup(category)
            .ok_or(StoreError::NoWriter(category))?;

        let request_context = self.correlator.create_request_context();
        let request = MultipartRequest::all(request_context.xid(), category.multipart_type());
        self.device.transport.send_multipart_request(request).await?;

        let parts = request_context.wait(self.config.request_timeout).await?;

        let Some(snapshot) = self.translate_parts(category, &parts)? else {
            debug!("{category} reply carried no data");
            return Ok(0);
        };
        let entries = snapshot.entry_count();

        let (write, commit) = self.diff(snapshot, initial);
        let removals = write.removals.len();

        let is_on_fly = initial && category == StatisticsCategory::Flow;
        writer.write(write, is_on_fly).await?;
        self.commit(category, commit);

        trace!("{category}: wrote {entries} entries, removed {removals} stale");
        Ok(entries)
    }

    fn translate_parts(
        &self,
        category: StatisticsCategory,
        parts: &[MultipartReply],
    ) -> Result<Option<StatisticsSnapshot>, TranslateError> {
        let datapath_id = self.datapath_id();
        let version = self.device.info.version;
        let mut merged: Option<StatisticsSnapshot> = None;

        for part in parts {
            let Some(snapshot) = self.translator.translate(datapath_id, version, part)? else {
                continue;
            };

            if snapshot.category() != category {
                return Err(TranslateError::Malformed {
                    multipart_type: "multipart",
                    reason: format!("expected {category}, got {}", snapshot.category()),
                });
            }

            match merged.as_mut() {
                Some(merged) => {
                    merged.merge(snapshot);
                }
                None => merged = Some(snapshot),
            }
        }

        Ok(merged)
    }

    /// Builds the write for `snapshot` together with the removals of stale keys.
    fn diff(&self, snapshot: StatisticsSnapshot, initial: bool) -> (StatisticsWrite, Commit) {
        let datapath_id = self.datapath_id();
        let mut flow_ids = Vec::new();
        let mut removals = Vec::new();

        let commit = match &snapshot.body {
            SnapshotBody::Flow(flows) => {
                let mut registry = self.registry.flows();
                let keys: Vec<FlowRegistryKey> =
                    flows.iter().map(FlowRegistryKey::from_statistics).collect();
                let reserved = registry.reserve_ids(&keys);
                flow_ids = reserved.iter().map(|(flow_id, _)| flow_id.clone()).collect();

                let mut stale = Vec::new();
                if !initial {
                    let current: HashSet<&FlowRegistryKey> = keys.iter().collect();
                    for key in registry.all_keys() {
                        if current.contains(&key) {
                            continue;
                        }
                        if let Some(descriptor) = registry.retrieve_descriptor(&key) {
                            removals.push(ItemKey::Flow {
                                table_id: descriptor.table_id,
                                flow_id: descriptor.flow_id.clone(),
                            });
                        }
                        stale.push(key);
                    }
                }

                let fresh = keys
                    .into_iter()
                    .zip(reserved)
                    .filter(|(_, (_, new))| *new)
                    .map(|(key, (flow_id, _))| (key, flow_id))
                    .collect();
                Commit::Flows { fresh, stale }
            }
            SnapshotBody::GroupDesc(groups) => {
                let registry = self.registry.groups();
                let (fresh, stale) = diff_ids(
                    groups.iter().map(|group| group.group_id),
                    registry.all_ids(),
                );
                removals.extend(stale.iter().map(|&group_id| ItemKey::Group(group_id)));
                Commit::Groups { fresh, stale }
            }
            SnapshotBody::MeterConfig(meters) => {
                let registry = self.registry.meters();
                let (fresh, stale) = diff_ids(
                    meters.iter().map(|meter| meter.meter_id),
                    registry.all_ids(),
                );
                removals.extend(stale.iter().map(|&meter_id| ItemKey::Meter(meter_id)));
                Commit::Meters { fresh, stale }
            }
            _ => {
                let fresh: HashSet<ItemKey> = snapshot.item_keys().into_iter().collect();
                let last_observed = self
                    .last_observed
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(previous) = last_observed.get(&snapshot.category()) {
                    removals.extend(previous.difference(&fresh).cloned());
                }
                Commit::Observed(fresh)
            }
        };

        let write = StatisticsWrite {
            datapath_id,
            snapshot: Arc::new(snapshot),
            flow_ids,
            removals,
        };

        (write, commit)
    }

    fn commit(&self, category: StatisticsCategory, commit: Commit) {
        match commit {
            Commit::Flows { fresh, stale } => {
                let mut registry = self.registry.flows();
                for (key, flow_id) in fresh {
                    registry.store(key, flow_id);
                }
                for key in stale {
                    registry.mark_to_be_removed(key);
                }
                registry.remove_marked();
            }
            Commit::Groups { fresh, stale } => {
                let mut registry = self.registry.groups();
                for group_id in fresh {
                    registry.store(group_id);
                }
                for group_id in stale {
                    registry.mark_to_be_removed(group_id);
                }
                registry.remove_marked();
            }
            Commit::Meters { fresh, stale } => {
                let mut registry = self.registry.meters();
                for meter_id in fresh {
                    registry.store(meter_id);
                }
                for meter_id in stale {
                    registry.mark_to_be_removed(meter_id);
                }
                registry.remove_marked();
            }
            Commit::Observed(fresh) => {
                self.last_observed
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(category, fresh);
            }
        }
    }
}

/// Splits reported ids into the ones not registered yet and the registered ones no longer reported.
fn diff_ids(reported: impl Iterator<Item = u32>, known: Vec<u32>) -> (Vec<u32>, Vec<u32>) {
    let reported: indexmap::IndexSet<u32> = reported.collect();
    let known: HashSet<u32> = known.into_iter().collect();

    let fresh = reported
        .iter()
        .copied()
        .filter(|id| !known.contains(id))
        .collect();
    let mut stale: Vec<u32> = known
        .into_iter()
        .filter(|id| !reported.contains(id))
        .collect();
    stale.sort_unstable();

    (fresh, stale)
}
