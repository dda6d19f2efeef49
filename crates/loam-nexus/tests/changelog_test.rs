//! Logged pushes feeding a durable change log, replayed by a mirror

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use loam_core::SlabOpts;
use loam_multiseqn::MultiSlabSeqn;
use loam_nexus::{Args, HandlerTable, Nexus, Pusher, Result as NexusResult};
use serde_json::{json, Value};

struct Counter {
    iden: String,
    count: AtomicI64,
}

impl Counter {
    fn new(iden: &str) -> Arc<Self> {
        Arc::new(Self {
            iden: iden.to_string(),
            count: AtomicI64::new(0),
        })
    }
}

impl Pusher for Counter {
    fn iden(&self) -> &str {
        &self.iden
    }

    fn mount(table: &mut HandlerTable<Self>) {
        table.on_logged("x:inc", |node, args| {
            Box::pin(async move {
                let amount = args.as_i64().unwrap_or(1);
                let new = node.count.fetch_add(amount, Ordering::SeqCst) + amount;
                Ok(Value::from(new))
            })
        });
    }
}

fn wire_changelog(nexus: &Arc<Nexus>, log: Arc<MultiSlabSeqn>) {
    nexus.set_push_hook(Arc::new(move |iden, event, args: Args| {
        let log = log.clone();
        Box::pin(async move {
            let entry = serde_json::to_vec(&json!({
                "iden": iden,
                "event": event,
                "args": args,
            }))?;
            log.add(&entry, None)?;
            NexusResult::Ok(())
        })
    }));
}

#[tokio::test]
async fn test_logged_pushes_replay_on_mirror() {
    let temp = tempfile::tempdir().unwrap();
    let opts = SlabOpts::new().with_map_size(1024 * 1024);
    let log = MultiSlabSeqn::open(temp.path().join("changelog"), opts).unwrap();

    // Leader: every logged push lands in the change log before running.
    let leader = Nexus::new("root");
    leader.attach(Counter::new("root")).unwrap();
    leader.attach(Counter::new("c1")).unwrap();
    wire_changelog(&leader, log.clone());

    leader
        .push_to("c1", "x:inc", Value::from(5))
        .await
        .unwrap();
    leader
        .push_to("c1", "x:inc", Value::from(2))
        .await
        .unwrap();
    leader.push("x:inc", Value::from(1)).await.unwrap();

    assert_eq!(log.next_index(), 3);

    // Mirror: replay the log through the same dispatch to converge.
    let mirror = Nexus::new("root");
    let mirror_root = Counter::new("root");
    let mirror_child = Counter::new("c1");
    mirror.attach(mirror_root.clone()).unwrap();
    mirror.attach(mirror_child.clone()).unwrap();

    for item in log.iter(0) {
        let (_indx, bytes) = item.unwrap();
        let entry: Value = serde_json::from_slice(&bytes).unwrap();
        let iden = entry["iden"].as_str().unwrap();
        let event = entry["event"].as_str().unwrap();
        mirror
            .push_to(iden, event, entry["args"].clone())
            .await
            .unwrap();
    }

    assert_eq!(mirror_child.count.load(Ordering::SeqCst), 7);
    assert_eq!(mirror_root.count.load(Ordering::SeqCst), 1);

    log.close().unwrap();
}
