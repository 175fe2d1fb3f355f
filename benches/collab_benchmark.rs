use criterion::{black_box, criterion_group, criterion_main, Criterion};
use roomplan_collab::broadcast::{Broadcaster, PeerQueue};
use roomplan_collab::locks::LockTable;
use roomplan_collab::presence::ParticipantTable;
use roomplan_collab::protocol::{
    ChatMessage, ClientFrame, CursorPosition, FurnitureItem, MutationEvent, ServerFrame,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn mutation_frame() -> ServerFrame {
    ServerFrame::MutationBroadcast {
        sequence: 42,
        origin: Uuid::new_v4(),
        event: MutationEvent::FurnitureMoved {
            element_id: "sofa_1".into(),
            x: 3.0,
            y: 4.0,
        },
    }
}

fn bench_mutation_encode(c: &mut Criterion) {
    let frame = mutation_frame();
    c.bench_function("mutation_frame_encode", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode().unwrap());
        })
    });
}

fn bench_mutation_decode(c: &mut Criterion) {
    let encoded = mutation_frame().encode().unwrap();
    c.bench_function("mutation_frame_decode", |b| {
        b.iter(|| {
            black_box(ServerFrame::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let frame = ServerFrame::CursorMoved {
        user_id: Uuid::new_v4(),
        x: 150.0,
        y: 250.0,
    };
    c.bench_function("cursor_frame_encode", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode().unwrap());
        })
    });
}

fn bench_client_frame_roundtrip(c: &mut Criterion) {
    let frame = ClientFrame::FurnitureAdd {
        item: FurnitureItem {
            element_id: "sofa_1".into(),
            kind: "sofa".into(),
            x: 1.0,
            y: 2.0,
            rotation: 90.0,
        },
    };
    c.bench_function("client_frame_roundtrip", |b| {
        b.iter(|| {
            let encoded = black_box(&frame).encode().unwrap();
            black_box(ClientFrame::decode(&encoded).unwrap());
        })
    });
}

fn bench_lock_grant_release(c: &mut Criterion) {
    c.bench_function("lock_grant_release", |b| {
        let mut table = LockTable::new(Duration::from_secs(1));
        let user = Uuid::new_v4();
        let element: String = "sofa_1".into();
        b.iter(|| {
            let now = Instant::now();
            black_box(table.try_lock(&element, user, now));
            black_box(table.unlock(&element, user));
        })
    });
}

fn bench_lock_contention_denied(c: &mut Criterion) {
    c.bench_function("lock_denied_fast_path", |b| {
        let mut table = LockTable::new(Duration::from_secs(3600));
        let holder = Uuid::new_v4();
        let challenger = Uuid::new_v4();
        let element: String = "sofa_1".into();
        table.try_lock(&element, holder, Instant::now());
        b.iter(|| {
            black_box(table.try_lock(&element, challenger, Instant::now()));
        })
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    c.bench_function("broadcast_100_peers", |b| {
        let mut broadcaster = Broadcaster::new();
        let mut queues = Vec::new();
        for _ in 0..100 {
            let queue = Arc::new(PeerQueue::new(2048));
            broadcaster.insert_peer(Uuid::new_v4(), queue.clone());
            queues.push(queue);
        }
        let frame = mutation_frame();
        b.iter(|| {
            black_box(broadcaster.broadcast(black_box(&frame), None));
        })
    });
}

fn bench_broadcast_1000_cursor_updates(c: &mut Criterion) {
    c.bench_function("broadcast_1000_cursors_100_peers", |b| {
        let mut broadcaster = Broadcaster::new();
        let mut queues = Vec::new();
        for _ in 0..100 {
            // Small queues so the eviction path is exercised.
            let queue = Arc::new(PeerQueue::new(64));
            broadcaster.insert_peer(Uuid::new_v4(), queue.clone());
            queues.push(queue);
        }
        let origin = Uuid::new_v4();
        b.iter(|| {
            for i in 0..1000u64 {
                let frame = ServerFrame::CursorMoved {
                    user_id: origin,
                    x: i as f32,
                    y: 0.0,
                };
                black_box(broadcaster.broadcast(&frame, Some(origin)));
            }
        })
    });
}

fn bench_participant_snapshot(c: &mut Criterion) {
    c.bench_function("participant_snapshot_100", |b| {
        let mut table = ParticipantTable::new();
        let now = Instant::now();
        for i in 0..100 {
            let user = Uuid::new_v4();
            table.join(user, format!("User{i}"), now);
            table.set_cursor(user, CursorPosition::new(i as f32, i as f32));
        }
        b.iter(|| {
            black_box(table.snapshot());
        })
    });
}

fn bench_chat_message_encode(c: &mut Criterion) {
    let frame = ServerFrame::ChatBroadcast {
        message: ChatMessage {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            username: "Alice".into(),
            text: "moved the sofa to the window wall".into(),
            timestamp_ms: 1_700_000_000_000,
            sequence: 7,
        },
    };
    c.bench_function("chat_frame_encode", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_mutation_encode,
    bench_mutation_decode,
    bench_cursor_encode,
    bench_client_frame_roundtrip,
    bench_lock_grant_release,
    bench_lock_contention_denied,
    bench_broadcast_100_peers,
    bench_broadcast_1000_cursor_updates,
    bench_participant_snapshot,
    bench_chat_message_encode,
);
criterion_main!(benches);
