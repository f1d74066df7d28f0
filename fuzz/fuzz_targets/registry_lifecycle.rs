#![no_main]

use std::collections::HashMap;

use libfuzzer_sys::fuzz_target;
use lodestone_core::registry::{
    KIND_DATABASE_DRIVER, KIND_FILE_WATCHER, KIND_REPAIR, KIND_VECTORIZATION, WorkerHandle,
    WorkerRegistry,
};

const KINDS: [&str; 4] = [
    KIND_DATABASE_DRIVER,
    KIND_FILE_WATCHER,
    KIND_VECTORIZATION,
    KIND_REPAIR,
];

/// Synthetic pid space far above any real pid, so nothing on the host
/// machine ever matches.
fn pid_for(raw: u8) -> u32 {
    10_000_000 + u32::from(raw % 32)
}

/// Shadow model of the registry: per kind, the (id, pid) pairs that the
/// real registry should be holding, in registration order.
type Model = HashMap<&'static str, Vec<(u64, Option<u32>)>>;

fn assert_matches_model(registry: &WorkerRegistry, model: &Model) {
    let mut expected_total = 0;
    for kind in KINDS {
        let expected = model.get(kind).map_or(&[][..], Vec::as_slice);
        expected_total += expected.len();

        assert_eq!(
            registry.count(kind),
            expected.len(),
            "count({kind}) diverged from the model"
        );

        let snapshot = registry.snapshot_kind(kind);
        let actual: Vec<(u64, Option<u32>)> =
            snapshot.iter().map(|h| (h.id(), h.pid())).collect();
        assert_eq!(actual, *expected, "snapshot_kind({kind}) diverged from the model");
    }

    assert_eq!(registry.total(), expected_total, "total diverged from the model");

    let mut expected_kinds: Vec<String> = model
        .iter()
        .filter(|(_, handles)| !handles.is_empty())
        .map(|(kind, _)| (*kind).to_string())
        .collect();
    expected_kinds.sort();
    assert_eq!(registry.kinds(), expected_kinds, "kinds list diverged");

    let status = registry.status();
    assert_eq!(
        status.total_workers(),
        expected_total,
        "status totals diverged from the registry"
    );
}

fuzz_target!(|data: &[u8]| {
    if data.len() > 65_536 {
        return;
    }

    let registry = WorkerRegistry::new();
    let mut model: Model = HashMap::new();
    let mut last_id = 0u64;

    for chunk in data.chunks(3) {
        let [op_tag, kind_raw, pid_raw] = match chunk {
            [a, b, c] => [*a, *b, *c],
            _ => break,
        };
        let kind = KINDS[usize::from(kind_raw) % KINDS.len()];

        match op_tag % 6 {
            0 => {
                let pid = pid_for(pid_raw);
                let handle = WorkerHandle::new(kind, format!("{kind}-{pid}")).with_pid(pid);
                let id = registry.register(handle);
                assert!(id > last_id, "handle ids must be strictly increasing");
                last_id = id;
                model.entry(kind).or_default().push((id, Some(pid)));
            }
            1 => {
                let handle = WorkerHandle::new(kind, format!("{kind}-anon"));
                let id = registry.register(handle);
                assert!(id > last_id, "handle ids must be strictly increasing");
                last_id = id;
                model.entry(kind).or_default().push((id, None));
            }
            2 => {
                let expected = model.get(kind).map_or(0, Vec::len);
                let removed = registry.unregister(kind, None);
                assert_eq!(removed, expected, "unregister(kind) count diverged");
                model.remove(kind);
            }
            3 => {
                let pid = pid_for(pid_raw);
                let expected = model
                    .get(kind)
                    .map_or(0, |handles| {
                        handles.iter().filter(|(_, p)| *p == Some(pid)).count()
                    });
                let removed = registry.unregister(kind, Some(pid));
                assert_eq!(removed, expected, "unregister(kind, pid) count diverged");
                if let Some(handles) = model.get_mut(kind) {
                    handles.retain(|(_, p)| *p != Some(pid));
                    if handles.is_empty() {
                        model.remove(kind);
                    }
                }
            }
            4 => {
                let expected: Vec<u64> = model
                    .get(kind)
                    .map_or_else(Vec::new, |handles| {
                        handles.iter().map(|(id, _)| *id).collect()
                    });
                let taken: Vec<u64> = registry
                    .take_kind(kind)
                    .iter()
                    .map(|handle| handle.id())
                    .collect();
                assert_eq!(taken, expected, "take_kind handles diverged");
                model.remove(kind);
            }
            _ => assert_matches_model(&registry, &model),
        }
    }

    assert_matches_model(&registry, &model);

    // drain everything; an emptied registry must report zero across the board
    for kind in KINDS {
        registry.take_kind(kind);
        model.remove(kind);
    }
    assert_eq!(registry.total(), 0, "drained registry still reports workers");
    assert!(registry.kinds().is_empty(), "drained registry still lists kinds");
    assert_eq!(registry.status().total_workers(), 0);
});
