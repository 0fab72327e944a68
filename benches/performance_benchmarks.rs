use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use vgo_notify::domain::{Frame, Notification, NotificationType, WireFrame};
use vgo_notify::ws::{Connection, Hub, NoopPresence};

fn connect_all(rt: &Runtime, hub: &Hub, users: i64, per_user: usize) -> Vec<mpsc::Receiver<Frame>> {
    let mut receivers = Vec::new();
    for user_id in 0..users {
        for _ in 0..per_user {
            let (conn, rx) = Connection::open(user_id, "10.0.0.1", "Mozilla/5.0 (bench)", 256);
            let meta = conn.meta(format!("user-{}", user_id));
            rt.block_on(hub.register(conn, &meta)).unwrap();
            receivers.push(rx);
        }
    }
    receivers
}

fn benchmark_frame_encoding(c: &mut Criterion) {
    let notification = Notification::new(NotificationType::OrderPaid, "order 10086 paid")
        .to_users([42])
        .with_payload(serde_json::json!({ "order_id": 10086, "amount": "99.00" }));

    c.bench_function("wire_frame_encode", |b| {
        b.iter(|| WireFrame::from_notification(black_box(&notification)).encode().unwrap())
    });
}

fn benchmark_send_to_user(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (hub, _task) = rt.block_on(async { Hub::spawn(Arc::new(NoopPresence), shutdown_rx) });
    let mut receivers = connect_all(&rt, &hub, 1, 4);
    let frame: Frame = Arc::from("{\"type\":\"order_paid\",\"content\":\"paid\"}");

    c.bench_function("send_to_user_4_sockets", |b| {
        b.iter(|| {
            let sent = rt.block_on(hub.send_to_user(0, black_box(&frame)));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
            sent
        })
    });
}

fn benchmark_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let frame: Frame = Arc::from("{\"type\":\"system_notice\",\"content\":\"maintenance\"}");

    for users in [10_i64, 100, 1000] {
        // 每组使用独立的 Hub
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hub, task) = rt.block_on(async { Hub::spawn(Arc::new(NoopPresence), shutdown_rx) });
        let mut receivers = connect_all(&rt, &hub, users, 1);

        c.bench_function(&format!("broadcast_{}_sockets", users), |b| {
            b.iter(|| {
                rt.block_on(async {
                    hub.broadcast(frame.clone()).await.unwrap();
                    for rx in receivers.iter_mut() {
                        black_box(rx.recv().await);
                    }
                })
            })
        });

        let _ = shutdown_tx.send(true);
        let _ = rt.block_on(task);
    }
}

criterion_group!(
    benches,
    benchmark_frame_encoding,
    benchmark_send_to_user,
    benchmark_broadcast
);
criterion_main!(benches);
