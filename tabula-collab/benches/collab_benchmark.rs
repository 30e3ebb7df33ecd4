use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use tabula_collab::broadcast::BroadcastGroup;
use tabula_collab::presence::{AwarenessMessage, CursorPosition, PresenceChannel};
use tabula_collab::protocol::{PeerInfo, SyncMessage};
use tabula_collab::storage::{DocumentStore, StoreConfig};
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = vec![0u8; 64];

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), black_box("lobby"), black_box(1), black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(Uuid::new_v4(), "lobby", 1, vec![0u8; 64]).encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_cursor_roundtrip(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let msg = AwarenessMessage::Update {
        peer_id: peer,
        clock: 1,
        color: "#ff8800".into(),
        cursor: Some(CursorPosition::new(100.0, 200.0)),
    };

    c.bench_function("cursor_message_roundtrip", |b| {
        b.iter(|| {
            let frame = SyncMessage::awareness(peer, "lobby", 1, black_box(&msg)).unwrap().encode().unwrap();
            black_box(SyncMessage::decode(&frame).unwrap().awareness_message().unwrap());
        })
    });
}

fn bench_presence_handle_1000(c: &mut Criterion) {
    let peers: Vec<Uuid> = (0..100).map(|_| Uuid::new_v4()).collect();

    c.bench_function("presence_handle_1000_updates", |b| {
        b.iter(|| {
            let mut channel = PresenceChannel::new(Uuid::new_v4(), "#000000");
            for i in 0..1000u64 {
                let peer_id = peers[(i % 100) as usize];
                channel.handle_message(&AwarenessMessage::Update {
                    peer_id,
                    clock: i + 1,
                    color: "#ffffff".into(),
                    cursor: Some(CursorPosition::new(i as f64, i as f64)),
                });
            }
            black_box(channel.others());
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(2048);
    let receivers: Vec<_> = rt.block_on(async {
        let mut rxs = Vec::new();
        for i in 0..100 {
            rxs.push(group.add_peer(PeerInfo::new(format!("peer-{i}"), "#000000")).await);
        }
        rxs
    });
    let frame = Arc::new(vec![0u8; 64]);
    let from = Uuid::new_v4();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(group.broadcast_raw(from, frame.clone()));
            }
        })
    });
    drop(receivers);
}

fn bench_store_update(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::at(dir.path())).unwrap();
    let update = vec![7u8; 128];

    c.bench_function("rocksdb_store_update_128B", |b| {
        b.iter(|| {
            black_box(store.store_update("bench", black_box(&update)).unwrap());
        })
    });
}

fn bench_load_state(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::at(dir.path())).unwrap();
    store.compact("bench", &vec![1u8; 16 * 1024], 0).unwrap();
    for _ in 0..100 {
        store.store_update("bench", &[2u8; 64]).unwrap();
    }

    c.bench_function("rocksdb_load_state_snapshot_plus_100", |b| {
        b.iter(|| {
            black_box(store.load_state("bench").unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_cursor_roundtrip,
    bench_presence_handle_1000,
    bench_broadcast_1000_messages,
    bench_store_update,
    bench_load_state,
);
criterion_main!(benches);
