// =============================================================================
// Object Registry — typed collection of live objects indexed by id and state
// =============================================================================
//
// A mapping from id -> object plus a set-per-state index. Generic over the
// object type `T` so the same registry implementation backs every runtime
// entity kind without needing a trait object; the Tick Loop is the only
// caller that needs to know `T` implements lifecycle hooks.
//
// Registry invariants (see spec §3):
//   - Exactly one entry per live id.
//   - Each object is indexed by both id and current state; the two stay in
//     sync across every transition.
//   - A `Destroyed` object is removed from the id index at the end of the
//     tick in which it entered that state.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::ids::{IdGenerator, ObjectId};
use crate::types::LifecycleState;

/// An event the registry emits on every state change, consumed by the Tick
/// Loop to maintain its working set without re-scanning the whole registry
/// every frame.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Created(ObjectId),
    StateChanged {
        id: ObjectId,
        from: LifecycleState,
        to: LifecycleState,
    },
    Destroyed(ObjectId),
}

struct Slot<T> {
    state: LifecycleState,
    object: T,
}

/// Typed, thread-safe registry of live runtime objects of kind `T`.
pub struct Registry<T> {
    ids: Arc<IdGenerator>,
    objects: RwLock<HashMap<ObjectId, Slot<T>>>,
    by_state: RwLock<HashMap<LifecycleState, BTreeSet<ObjectId>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl<T> Registry<T> {
    pub fn new(ids: Arc<IdGenerator>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let mut by_state = HashMap::new();
        for state in LifecycleState::ALL {
            by_state.insert(state, BTreeSet::new());
        }
        Self {
            ids,
            objects: RwLock::new(HashMap::new()),
            by_state: RwLock::new(by_state),
            events,
        }
    }

    /// Subscribe to registry lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Assign a new id and insert the object `f` constructs from it, in the
    /// `Ready` state. Taking a constructor rather than a ready-made object
    /// lets `f` stamp the freshly-assigned id onto the object itself before
    /// it is ever observed by another thread.
    pub fn insert_with(&self, f: impl FnOnce(ObjectId) -> T) -> ObjectId {
        let id = self.ids.next();
        let object = f(id);
        {
            let mut objects = self.objects.write();
            objects.insert(id, Slot {
                state: LifecycleState::Ready,
                object,
            });
        }
        self.by_state.write().get_mut(&LifecycleState::Ready).unwrap().insert(id);

        debug!(object_id = %id, "object inserted into registry (Ready)");
        let _ = self.events.send(RegistryEvent::Created(id));
        id
    }

    /// Attempt to move `id` from its current state to `to`. Rejects illegal
    /// transitions per [`LifecycleState::can_transition_to`].
    pub fn transition(&self, id: ObjectId, to: LifecycleState) -> Result<(), EngineError> {
        let from = {
            let mut objects = self.objects.write();
            let slot = objects
                .get_mut(&id)
                .ok_or_else(|| EngineError::IllegalTransition(format!("unknown object {id}")))?;

            if !slot.state.can_transition_to(to) {
                return Err(EngineError::IllegalTransition(format!(
                    "{id}: {} -> {} is not a legal transition",
                    slot.state, to
                )));
            }
            let from = slot.state;
            slot.state = to;
            from
        };

        {
            let mut by_state = self.by_state.write();
            by_state.get_mut(&from).unwrap().remove(&id);
            by_state.get_mut(&to).unwrap().insert(id);
        }

        debug!(object_id = %id, from = %from, to = %to, "object transitioned");
        let _ = self.events.send(RegistryEvent::StateChanged { id, from, to });
        if to == LifecycleState::Destroyed {
            let _ = self.events.send(RegistryEvent::Destroyed(id));
        }
        Ok(())
    }

    /// Snapshot of every id currently in `state`, in ascending id order —
    /// the Tick Loop's hook-ordering guarantee depends on this order.
    /// Safe to call while other threads call `transition`: the snapshot
    /// reflects the registry at the moment of the call and is unaffected by
    /// subsequent mutations.
    pub fn iterate(&self, state: LifecycleState) -> Vec<ObjectId> {
        self.by_state.read().get(&state).unwrap().iter().copied().collect()
    }

    /// Apply `f` to the object behind `id` under a write lock. Returns
    /// `None` if `id` is not present (e.g. it was removed concurrently).
    pub fn with_mut<R>(&self, id: ObjectId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut objects = self.objects.write();
        objects.get_mut(&id).map(|slot| f(&mut slot.object))
    }

    /// Apply `f` to the object behind `id` under a read lock.
    pub fn with_ref<R>(&self, id: ObjectId, f: impl FnOnce(&T) -> R) -> Option<R> {
        let objects = self.objects.read();
        objects.get(&id).map(|slot| f(&slot.object))
    }

    /// Current lifecycle state of `id`, if it exists.
    pub fn state_of(&self, id: ObjectId) -> Option<LifecycleState> {
        self.objects.read().get(&id).map(|slot| slot.state)
    }

    /// Remove `id` from the registry. Legal only when the object is in
    /// `Destroyed` state.
    pub fn remove(&self, id: ObjectId) -> Result<(), EngineError> {
        let mut objects = self.objects.write();
        match objects.get(&id) {
            None => return Err(EngineError::IllegalTransition(format!("unknown object {id}"))),
            Some(slot) if slot.state != LifecycleState::Destroyed => {
                return Err(EngineError::IllegalTransition(format!(
                    "{id} cannot be removed from state {}",
                    slot.state
                )));
            }
            _ => {}
        }
        objects.remove(&id);
        drop(objects);
        self.by_state.write().get_mut(&LifecycleState::Destroyed).unwrap().remove(&id);
        debug!(object_id = %id, "object removed from registry");
        Ok(())
    }

    /// Remove every object currently in `Destroyed` state. Called once per
    /// tick by the Tick Loop's compaction step.
    pub fn compact(&self) {
        let destroyed: Vec<ObjectId> = self.iterate(LifecycleState::Destroyed);
        for id in destroyed {
            if let Err(e) = self.remove(id) {
                warn!(object_id = %id, error = %e, "compaction failed to remove object");
            }
        }
    }

    /// Total number of live objects across all states.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of objects per state, used by `getSystemOverview()`.
    pub fn counts_by_state(&self) -> HashMap<LifecycleState, usize> {
        self.by_state
            .read()
            .iter()
            .map(|(state, ids)| (*state, ids.len()))
            .collect()
    }
}
