use criterion::{criterion_group, criterion_main, Criterion};
use sanctuary_collab::broadcast::{BroadcastGroup, RelayFrame};
use sanctuary_collab::clock::ManualClock;
use sanctuary_collab::connection::TransportHandle;
use sanctuary_collab::presence::{CursorIntervals, PresenceBroadcaster};
use sanctuary_collab::protocol::{
    ClientEvent, Collaborator, CollaboratorPatch, Position, PresenceUpdate, ServerEvent, SyncMode,
};
use sanctuary_collab::registry::CollaboratorRegistry;
use sanctuary_collab::state_sync::{diff, StateSnapshot};
use serde_json::{json, Value};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn snapshot(value: Value) -> StateSnapshot {
    match value {
        Value::Object(map) => map,
        _ => StateSnapshot::new(),
    }
}

fn wide_snapshot(keys: usize, salt: usize) -> StateSnapshot {
    (0..keys)
        .map(|i| {
            let value = if i % 10 == 0 { json!(i + salt) } else { json!(i) };
            (format!("key{i}"), value)
        })
        .collect()
}

fn bench_cursor_encode(c: &mut Criterion) {
    let event = ClientEvent::CursorUpdate { position: Position::new(412.5, 96.0) };

    c.bench_function("cursor_update_encode", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_cursor_decode(c: &mut Criterion) {
    let frame = ServerEvent::CursorUpdate { user_id: "u-42".into(), position: Position::new(412.5, 96.0) }
        .encode()
        .unwrap();

    c.bench_function("cursor_update_decode", |b| {
        b.iter(|| {
            black_box(ServerEvent::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_state_sync_roundtrip(c: &mut Criterion) {
    let patch = snapshot(json!({
        "file": "src/main.ts",
        "line": 120,
        "selection": {"start": 4, "end": 19},
        "openTabs": ["a.ts", "b.ts", "c.ts"],
    }));

    c.bench_function("state_sync_roundtrip", |b| {
        b.iter(|| {
            let frame = ClientEvent::StateSync(patch.clone()).encode().unwrap();
            black_box(ClientEvent::decode(&frame).unwrap());
        })
    });
}

fn bench_presence_update_decode(c: &mut Criterion) {
    let frame = ServerEvent::PresenceUpdate(PresenceUpdate {
        user_id: "u-7".into(),
        patch: CollaboratorPatch::video(true),
    })
    .encode()
    .unwrap();

    c.bench_function("presence_update_decode", |b| {
        b.iter(|| {
            black_box(ServerEvent::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_throttle_should_emit(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new());
    let presence = PresenceBroadcaster::new(
        TransportHandle::detached(),
        clock,
        SyncMode::Express,
        CursorIntervals::default(),
    );

    c.bench_function("throttle_should_emit", |b| {
        let mut t = 0u64;
        b.iter(|| {
            t += 1;
            black_box(presence.should_emit(black_box(Duration::from_millis(t))));
        })
    });
}

fn bench_diff_small(c: &mut Criterion) {
    let last = snapshot(json!({"file": "x.ts", "line": 3, "theme": "dark"}));
    let candidate = snapshot(json!({"file": "y.ts", "line": 10, "theme": "dark"}));

    c.bench_function("diff_3_keys", |b| {
        b.iter(|| {
            black_box(diff(black_box(&last), black_box(&candidate)));
        })
    });
}

fn bench_diff_wide(c: &mut Criterion) {
    let last = wide_snapshot(1000, 0);
    let candidate = wide_snapshot(1000, 1);

    c.bench_function("diff_1000_keys_10pct_changed", |b| {
        b.iter(|| {
            let changed = diff(black_box(&last), black_box(&candidate));
            debug_assert_eq!(changed.len(), 100);
            black_box(changed);
        })
    });
}

fn bench_registry_churn(c: &mut Criterion) {
    c.bench_function("registry_100_join_update_leave", |b| {
        b.iter(|| {
            let mut registry = CollaboratorRegistry::new(Collaborator::new("me", "Me"));
            for i in 0..100 {
                registry.join(Collaborator::new(format!("u{i}"), format!("User{i}")));
            }
            for i in 0..100 {
                registry.merge_update(&format!("u{i}"), &CollaboratorPatch::mic(true));
            }
            for i in (0..100).step_by(2) {
                registry.leave(&format!("u{i}"));
            }
            black_box(registry.collaborators());
        })
    });
}

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = Collaborator::new(format!("u{i}"), format!("User{i}"));
                    let rx = group.add_peer(Uuid::new_v4(), peer).await;
                    receivers.push(rx);
                }

                let frame = Arc::new(RelayFrame { origin: Uuid::new_v4(), payload: "{}".into() });
                let count = group.broadcast_raw(black_box(frame));
                black_box(count);
            });
        })
    });
}

fn bench_broadcast_1000_cursors(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_cursors_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = Collaborator::new(format!("u{i}"), format!("User{i}"));
                    let rx = group.add_peer(Uuid::new_v4(), peer).await;
                    receivers.push(rx);
                }

                let origin = Uuid::new_v4();
                for i in 0..1000u32 {
                    let event = ServerEvent::CursorUpdate {
                        user_id: "u0".into(),
                        position: Position::new(f64::from(i), 0.0),
                    };
                    let _ = group.broadcast(origin, black_box(&event));
                }
            });
        })
    });
}

criterion_group!(
    benches,
    bench_cursor_encode,
    bench_cursor_decode,
    bench_state_sync_roundtrip,
    bench_presence_update_decode,
    bench_throttle_should_emit,
    bench_diff_small,
    bench_diff_wide,
    bench_registry_churn,
    bench_broadcast_raw,
    bench_broadcast_1000_cursors,
);
criterion_main!(benches);
