use cluster_agent_core::DeltaKind;
use cluster_agent_k8s_api::{DynamicObject, Event, ObjectExt};
use std::{collections::HashMap, sync::Arc};

/// The cached set of objects of one watched kind, keyed by UID.
#[derive(Debug, Default)]
pub(crate) struct WorldState {
    objects: HashMap<String, Arc<DynamicObject>>,
    /// Objects received during a relist, applied once the relist completes.
    relist: Option<HashMap<String, Arc<DynamicObject>>>,
}

pub(crate) type Change = (DeltaKind, Arc<DynamicObject>);

// === impl WorldState ===

impl WorldState {
    /// Applies a watch event, returning the changes it caused in order.
    pub(crate) fn apply(&mut self, event: Event<DynamicObject>) -> Vec<Change> {
        match event {
            Event::Apply(obj) => {
                let obj = Arc::new(obj);
                let kind = match self.objects.insert(key(&obj), obj.clone()) {
                    Some(_) => DeltaKind::Updated,
                    None => DeltaKind::Added,
                };
                vec![(kind, obj)]
            }

            Event::Delete(obj) => {
                let obj = Arc::new(obj);
                self.objects.remove(&key(&obj));
                vec![(DeltaKind::Deleted, obj)]
            }

            Event::Init => {
                self.relist = Some(HashMap::new());
                vec![]
            }

            Event::InitApply(obj) => {
                let obj = Arc::new(obj);
                self.relist
                    .get_or_insert_with(HashMap::new)
                    .insert(key(&obj), obj);
                vec![]
            }

            Event::InitDone => {
                let relisted = self.relist.take().unwrap_or_default();
                self.reconcile(relisted)
            }
        }
    }

    /// Replaces the cached set with a relisted one, emitting the differences.
    fn reconcile(&mut self, relisted: HashMap<String, Arc<DynamicObject>>) -> Vec<Change> {
        let mut changes = Vec::new();

        let mut removed = self
            .objects
            .iter()
            .filter(|(k, _)| !relisted.contains_key(*k))
            .map(|(_, obj)| obj.clone())
            .collect::<Vec<_>>();
        removed.sort_by(|a, b| order(a).cmp(&order(b)));
        changes.extend(removed.into_iter().map(|obj| (DeltaKind::Deleted, obj)));

        let mut upserts = relisted
            .iter()
            .filter_map(|(k, obj)| match self.objects.get(k) {
                None => Some((DeltaKind::Added, obj.clone())),
                Some(prev) if prev.metadata.resource_version != obj.metadata.resource_version => {
                    Some((DeltaKind::Updated, obj.clone()))
                }
                Some(_) => None,
            })
            .collect::<Vec<_>>();
        upserts.sort_by(|(_, a), (_, b)| order(a).cmp(&order(b)));
        changes.extend(upserts);

        self.objects = relisted;
        changes
    }

    /// A shallow copy of the cached set, ordered by namespace and name.
    pub(crate) fn snapshot(&self) -> Vec<Arc<DynamicObject>> {
        let mut objs = self.objects.values().cloned().collect::<Vec<_>>();
        objs.sort_by(|a, b| order(a).cmp(&order(b)));
        objs
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }
}

fn key(obj: &DynamicObject) -> String {
    match obj.uid() {
        Some(uid) => uid.to_string(),
        None => format!("{}/{}", obj.object_namespace(), obj.object_name()),
    }
}

fn order(obj: &DynamicObject) -> (&str, &str) {
    (obj.object_namespace(), obj.object_name())
}
