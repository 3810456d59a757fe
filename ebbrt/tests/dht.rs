//! Distributed hash table end to end, over an in-memory process group.

use bytes::Bytes;
use ebbrt::dht::{owner_of, DistributedHashTable};
use ebbrt::ebb::{EbbId, EbbRef, SharedRoot};
use ebbrt::group::{LocalGroup, ProcessGroup};
use ebbrt::messaging::{Completion, GroupMessenger, Messenger, NetworkId};
use ebbrt::runtime::{Context, DhtConfig, Runtime, RuntimeConfig};
use std::sync::Arc;

const DHT_ID: EbbId = EbbId::new(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One simulated process: its own runtime, one context and the table.
struct Node {
    ctx: Context,
    dht: Arc<DistributedHashTable>,
}

fn node(group: LocalGroup, nodes: Vec<NetworkId>) -> Node {
    let local = group.rank() as usize;
    let group: Arc<dyn ProcessGroup> = Arc::new(group);
    let messenger = GroupMessenger::new(group, 0);
    let dht_messenger: Arc<dyn Messenger> = messenger.clone();
    let dht_config = DhtConfig::new(nodes, local);

    let config = RuntimeConfig::builder().static_ebb("HashTable", DHT_ID).build();
    let runtime = Runtime::builder(config)
        .initializer("HashTable", move |_, id| {
            let dht = DistributedHashTable::new(id, dht_messenger.clone(), dht_config.clone())?;
            Ok(Arc::new(SharedRoot::new(Arc::new(dht))))
        })
        .build()
        .unwrap();

    let ctx = Context::new(&runtime).unwrap();
    messenger
        .start_listening(ctx.events(), ctx.resolver().clone())
        .unwrap();
    let dht = ctx
        .resolve_as(EbbRef::<DistributedHashTable>::new(DHT_ID))
        .unwrap();
    Node { ctx, dht }
}

fn cluster(size: u32) -> Vec<Node> {
    let addresses: Vec<NetworkId> = (0..size).map(|rank| NetworkId::rank(rank, 0)).collect();
    LocalGroup::create(size)
        .into_iter()
        .map(|group| node(group, addresses.clone()))
        .collect()
}

/// Pump every node until none has anything left to dispatch.
fn settle(nodes: &[Node]) {
    loop {
        let mut progressed = false;
        for node in nodes {
            while node.ctx.events().try_pump().unwrap() {
                progressed = true;
            }
        }
        if !progressed {
            return;
        }
    }
}

/// First key from a fixed candidate list owned by `owner`.
fn key_owned_by(owner: usize, node_count: usize) -> Vec<u8> {
    (0..1_000)
        .map(|i| format!("key-{i}").into_bytes())
        .find(|key| owner_of(key, node_count) == owner)
        .unwrap()
}

#[test]
fn test_single_node_set_then_get() {
    init_tracing();
    let nodes = cluster(1);
    let dht = &nodes[0].dht;

    dht.set(b"foo", "bar", None).unwrap();
    let (on_value, mut value) = Completion::channel();
    dht.get(b"foo", on_value, None).unwrap();
    assert_eq!(value.try_recv().unwrap(), Some(Bytes::from_static(b"bar")));
}

#[test]
fn test_remote_get_of_absent_key_yields_none() {
    init_tracing();
    let nodes = cluster(2);
    let key = key_owned_by(1, 2);
    assert!(!nodes[0].dht.is_local(&key));

    let (on_value, mut value) = Completion::channel();
    nodes[0].dht.get(&key, on_value, None).unwrap();
    assert_eq!(nodes[0].dht.pending(), 1);

    settle(&nodes);
    assert_eq!(value.try_recv().unwrap(), None);
    assert_eq!(nodes[0].dht.pending(), 0);
}

#[test]
fn test_remote_set_then_get() {
    init_tracing();
    let nodes = cluster(2);
    let key = key_owned_by(1, 2);

    let (on_sent, mut sent) = Completion::channel();
    nodes[0].dht.set(&key, "remote", Some(on_sent)).unwrap();
    settle(&nodes);
    sent.try_recv().unwrap();

    // Read at the owner, then from the other node.
    let (on_value, mut local) = Completion::channel();
    nodes[1].dht.get(&key, on_value, None).unwrap();
    assert_eq!(local.try_recv().unwrap(), Some(Bytes::from_static(b"remote")));

    let (on_value, mut remote) = Completion::channel();
    nodes[0].dht.get(&key, on_value, None).unwrap();
    settle(&nodes);
    assert_eq!(remote.try_recv().unwrap(), Some(Bytes::from_static(b"remote")));

    nodes[0].dht.free(&key, None).unwrap();
    settle(&nodes);
    let (on_value, mut freed) = Completion::channel();
    nodes[1].dht.get(&key, on_value, None).unwrap();
    assert_eq!(freed.try_recv().unwrap(), None);
}

#[test]
fn test_sync_get_released_in_threshold_order() {
    init_tracing();
    let nodes = cluster(2);
    let key = key_owned_by(1, 2);

    let (at_two, mut two) = Completion::channel();
    let (at_five, mut five) = Completion::channel();
    nodes[0].dht.sync_get(&key, 2, at_two, None).unwrap();
    nodes[0].dht.sync_get(&key, 5, at_five, None).unwrap();
    settle(&nodes);
    assert!(two.try_recv().is_err());
    assert!(five.try_recv().is_err());

    nodes[0].dht.sync_set(&key, "v1", 2, None).unwrap();
    settle(&nodes);
    assert_eq!(two.try_recv().unwrap(), Some(Bytes::from_static(b"v1")));
    assert!(five.try_recv().is_err());

    nodes[0].dht.sync_set(&key, "v2", 3, None).unwrap();
    settle(&nodes);
    assert_eq!(five.try_recv().unwrap(), Some(Bytes::from_static(b"v2")));

    // Threshold already met: answered without parking.
    let (late, mut late_value) = Completion::channel();
    nodes[0].dht.sync_get(&key, 4, late, None).unwrap();
    settle(&nodes);
    assert_eq!(late_value.try_recv().unwrap(), Some(Bytes::from_static(b"v2")));
}

#[test]
fn test_increments_are_sequential_across_nodes() {
    init_tracing();
    let nodes = cluster(2);
    let key = key_owned_by(1, 2);

    let mut seen = Vec::new();
    for i in 0..6 {
        let (on_value, mut value) = Completion::channel();
        nodes[i % 2].dht.increment(&key, on_value, None).unwrap();
        settle(&nodes);
        seen.push(value.try_recv().unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn test_keys_spread_over_owners() {
    init_tracing();
    let nodes = cluster(3);
    for owner in 0..3 {
        let key = key_owned_by(owner, 3);
        nodes[(owner + 1) % 3].dht.set(&key, format!("v{owner}"), None).unwrap();
    }
    settle(&nodes);

    for (owner, node) in nodes.iter().enumerate() {
        let key = key_owned_by(owner, 3);
        assert!(node.dht.is_local(&key));
        let (on_value, mut value) = Completion::channel();
        node.dht.get(&key, on_value, None).unwrap();
        assert_eq!(value.try_recv().unwrap(), Some(Bytes::from(format!("v{owner}"))));
    }
}
