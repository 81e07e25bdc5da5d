use crate::embedder::EmbedderHeapTracer;
use crate::heap::space::SpaceId;
use crate::object::ObjectRef;
use crate::tests::fixture::GcFixture;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct TracerState {
    wrappers_seen: Vec<ObjectRef>,
    /// Objects only reachable through foreign memory, keyed by wrapper.
    interior_roots: Vec<(ObjectRef, ObjectRef)>,
    final_pause_entered: bool,
}

struct TestTracer {
    state: Arc<Mutex<TracerState>>,
    pending: Vec<ObjectRef>,
}

impl EmbedderHeapTracer for TestTracer {
    fn enter_final_pause(&mut self) {
        self.state.lock().unwrap().final_pause_entered = true;
    }

    fn register_wrappers(&mut self, wrappers: &[ObjectRef]) {
        let mut state = self.state.lock().unwrap();
        for wrapper in wrappers {
            state.wrappers_seen.push(*wrapper);
            for (host, interior) in &state.interior_roots {
                if host == wrapper {
                    self.pending.push(*interior);
                }
            }
        }
    }

    fn trace(&mut self, _deadline_items: usize, reached: &mut dyn FnMut(ObjectRef)) -> bool {
        for obj in self.pending.drain(..) {
            reached(obj);
        }
        true
    }

    fn is_remote_tracing_done(&self) -> bool {
        self.pending.is_empty()
    }
}

#[test]
fn wrapper_objects_route_through_the_embedder() {
    let mut f = GcFixture::new();
    let state: Arc<Mutex<TracerState>> = Arc::default();

    let payload = f.heap.new_fixed_array(1, SpaceId::Old);
    let wrapper = f.heap.new_wrapper(1, f.strong(payload), SpaceId::Old);
    // An object only the embedder knows about.
    let hidden = f.heap.new_fixed_array(2, SpaceId::Old);
    // And one the embedder does not reach: it must die.
    let unreachable = f.heap.new_fixed_array(2, SpaceId::Old);
    state
        .lock()
        .unwrap()
        .interior_roots
        .push((wrapper, hidden));

    f.gc.full.set_embedder_tracer(Box::new(TestTracer {
        state: state.clone(),
        pending: Vec::new(),
    }));
    let _rw = f.root(wrapper);

    f.collect_full();

    let heap = &f.heap;
    assert!(heap.is_black(wrapper) && heap.is_black(payload));
    assert!(heap.is_black(hidden), "embedder-reported root must survive");
    assert!(!heap.is_black(unreachable));
    let state = state.lock().unwrap();
    assert!(state.final_pause_entered);
    assert_eq!(state.wrappers_seen, vec![wrapper]);
}

#[cfg(feature = "sandbox")]
#[test]
fn external_pointer_table_sweeps_dead_entries() {
    let mut f = GcFixture::new();
    let live_handle = f.heap.external_pointer_table.allocate(0xdead_beef) as i64;
    let dead_handle = f.heap.external_pointer_table.allocate(0xfeed_face);

    let wrapper = f.heap.new_wrapper(live_handle, f.strong(f.heap.well_known().undefined), SpaceId::Old);
    let _rw = f.root(wrapper);

    f.collect_full();

    assert!(f.heap.external_pointer_table.get(live_handle as usize).is_some());
    assert!(f.heap.external_pointer_table.get(dead_handle).is_none());
}
