//! Link lifecycle: pipes, status, sync, paths and channels.
//!
//! Every test drives a real mesh over the fake exchange and in-memory pipes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use telehash_core::encoding::base32_encode;
use telehash_core::{Csid, Keys, Packet, Path};
use telehash_mesh::testing::{FakeIdentity, FakePeer, MemoryResolver, fake_mesh, json_map};
use telehash_mesh::{
    Extensions, Link, LinkArgs, LinkStatus, Mesh, MeshConfig, MeshError, MeshEvent, StatusObserver,
};
use telehash_transport::testing::MemoryPipe;
use telehash_transport::{Pipe, PipeEvent, spawn_keepalive};

const WAIT: Duration = Duration::from_secs(1);

fn udp(port: u16) -> Path {
    Path::new("udp4").with("ip", "10.0.0.2").with("port", port)
}

async fn linked(mesh: &Arc<Mesh>, peer: &FakePeer, pipe: &Arc<MemoryPipe>) -> Arc<Link> {
    mesh.link(LinkArgs::keys(peer.keys()).with_pipe(pipe.clone()))
        .await
        .unwrap()
}

/// Make sure consecutive `Instant::now()` calls differ.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn link_from_keys_creates_exchange_and_indexes_token() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);

    let link = mesh.link(LinkArgs::keys(peer.keys())).await.unwrap();

    assert_eq!(link.hashname(), peer.hashname());
    assert_eq!(link.status(), LinkStatus::Init);
    assert!(link.exchange().is_some());
    assert!(Arc::ptr_eq(&mesh.link_by_token(&peer.link_token()).unwrap(), &link));
    assert!(!link.create_exchange(), "exchange is created only once");
}

#[tokio::test]
async fn linking_twice_returns_the_same_link() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);

    let first = mesh.link(LinkArgs::hashname(peer.hashname())).await.unwrap();
    let second = mesh.link(LinkArgs::keys(peer.keys())).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(second.exchange().is_some());
    assert_eq!(mesh.links().len(), 1);
}

#[tokio::test]
async fn linking_to_self_is_refused() {
    let (mesh, _) = fake_mesh(1);
    let result = mesh.link(LinkArgs::hashname(mesh.hashname())).await;
    assert!(matches!(result, Err(MeshError::SelfLink)));
}

#[tokio::test]
async fn link_without_identity_is_invalid() {
    let (mesh, _) = fake_mesh(1);
    let result = mesh.link(LinkArgs::default()).await;
    assert!(matches!(result, Err(MeshError::InvalidArgs(_))));
}

#[tokio::test]
async fn no_common_cipher_suite_leaves_link_inert() {
    let (mesh, _) = fake_mesh(1);
    let keys: Keys = [(Csid(0x3a), vec![9u8; 32])].into_iter().collect();

    let link = mesh.link(LinkArgs::keys(keys)).await.unwrap();

    assert_eq!(link.csid(), None);
    assert!(link.exchange().is_none());
    assert!(!link.sync());
}

#[tokio::test]
async fn link_from_config_entries() {
    let local = FakeIdentity::new(1);
    let peer = FakePeer::new(2, &local);
    let toml = format!(
        r#"
[mesh]
accept_unknown = false

[[links]]
router = true
keys = {{ "1a" = "{}" }}

[[links.paths]]
type = "udp4"
ip = "10.0.0.2"
port = 42424
"#,
        base32_encode(&[2u8; 32])
    );
    let config = MeshConfig::parse(&toml).unwrap();

    let mesh = Mesh::from_config(local, &config, Extensions::new()).await.unwrap();

    assert!(!mesh.settings().accept_unknown);
    let link = mesh.get(&peer.hashname()).unwrap();
    assert_eq!(link.paths(), vec![udp(42424)]);
    assert_eq!(mesh.routers(), vec![peer.hashname()]);
}

// ---------------------------------------------------------------------------
// Pipes and status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_pipe_receives_handshake() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));

    let link = linked(&mesh, &peer, &pipe).await;

    assert!(pipe.wait_for_sent(1, WAIT).await);
    let sent = peer.read_all(&pipe);
    assert_eq!(sent[0].json_str("type"), Some("link"));
    assert_eq!(sent[0].json_u32("at"), Some(1));
    assert_eq!(link.pipes().len(), 1);
    assert_eq!(link.status(), LinkStatus::Init, "unseen pipe does not bring the link up");

    link.add_pipe(pipe.clone(), true);
    assert_eq!(link.status(), LinkStatus::Up);
}

#[tokio::test]
async fn stale_pipe_readded_unseen_gets_handshake_again() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = linked(&mesh, &peer, &pipe).await;
    assert!(pipe.wait_for_sent(1, WAIT).await);
    link.add_pipe(pipe.clone(), true);
    pipe.clear_sent();

    link.add_pipe(pipe.clone(), false);
    tick().await;
    assert_eq!(pipe.sent_count(), 0, "fresh pipe is left alone");

    tick().await;
    assert!(link.sync());
    assert!(pipe.wait_for_sent(1, WAIT).await);
    pipe.clear_sent();

    assert!(!link.add_pipe(pipe.clone(), false));
    assert!(pipe.wait_for_sent(1, WAIT).await);
    let resent = peer.read_all(&pipe);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].json_u32("at"), Some(link.exchange().unwrap().at()));
    assert_eq!(link.pipes().len(), 1);
}

#[tokio::test]
async fn pipe_without_exchange_receives_empty_packet() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));

    mesh.link(LinkArgs::hashname(peer.hashname()).with_pipe(pipe.clone()))
        .await
        .unwrap();

    assert!(pipe.wait_for_sent(1, WAIT).await);
    assert_eq!(pipe.sent_packets(), vec![Packet::empty()]);
}

#[tokio::test]
async fn same_path_pipe_is_not_added_twice() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = linked(&mesh, &peer, &pipe).await;

    link.add_pipe(MemoryPipe::new(udp(42424)), true);

    assert_eq!(link.pipes().len(), 1);
    assert_eq!(link.pipes()[0].id(), pipe.id());
    assert!(link.has_seen(pipe.as_ref()));
}

#[tokio::test]
async fn removing_all_pipes_goes_down_and_seen_pipe_comes_back_up() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = linked(&mesh, &peer, &pipe).await;

    link.add_pipe(pipe.clone(), true);
    assert_eq!(link.status(), LinkStatus::Up);

    assert!(link.remove_pipe(pipe.id()));
    assert_eq!(link.status(), LinkStatus::Down("no pipes".into()));
    assert!(link.pipes().is_empty());

    link.add_pipe(pipe.clone(), true);
    assert_eq!(link.status(), LinkStatus::Up);
}

#[tokio::test]
async fn link_stays_up_while_another_pipe_is_fresh() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let a = MemoryPipe::new(udp(1));
    let b = MemoryPipe::new(udp(2));
    let link = linked(&mesh, &peer, &a).await;
    link.add_pipe(a.clone(), true);
    link.add_pipe(b.clone(), true);

    a.emit(PipeEvent::Down);
    assert!(link.is_up());

    b.emit(PipeEvent::Down);
    assert_eq!(link.status(), LinkStatus::Down("all pipes are down".into()));
}

#[tokio::test]
async fn closed_pipe_event_removes_pipe() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = linked(&mesh, &peer, &pipe).await;
    link.add_pipe(pipe.clone(), true);

    pipe.emit(PipeEvent::Closed);

    assert!(link.pipes().is_empty());
    assert!(link.status().is_down());
    assert_eq!(pipe.emit(PipeEvent::Keepalive), 0, "subscription was dropped");
}

#[tokio::test]
async fn close_removes_every_pipe() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let a = MemoryPipe::new(udp(1));
    let link = linked(&mesh, &peer, &a).await;
    link.add_pipe(MemoryPipe::new(udp(2)), true);

    link.close();

    assert!(link.pipes().is_empty());
    assert!(link.status().is_down());
}

#[tokio::test]
async fn removed_link_leaves_registry_and_index() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    linked(&mesh, &peer, &pipe).await;

    let removed = mesh.remove(&peer.hashname()).unwrap();

    assert!(mesh.get(&peer.hashname()).is_none());
    assert!(mesh.link_by_token(&peer.link_token()).is_none());
    assert!(removed.pipes().is_empty());
}

// ---------------------------------------------------------------------------
// Sync and ranking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_advances_at_and_handshakes_every_pipe() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let a = MemoryPipe::new(udp(1));
    let b = MemoryPipe::new(udp(2));
    let link = linked(&mesh, &peer, &a).await;
    link.add_pipe(b.clone(), true);
    assert!(a.wait_for_sent(1, WAIT).await);
    a.clear_sent();

    let exchange = link.exchange().unwrap();
    let before = exchange.at();
    assert!(link.sync());
    assert_eq!(exchange.at(), before + 1);
    assert!(link.sync());
    assert_eq!(exchange.at(), before + 2);

    assert!(a.wait_for_sent(2, WAIT).await);
    assert!(b.wait_for_sent(2, WAIT).await);
    let ats: Vec<u32> = peer
        .read_all(&b)
        .iter()
        .filter_map(|packet| packet.json_u32("at"))
        .collect();
    assert!(ats.iter().all(|at| *at > before));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_syncs_each_advance_at() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = linked(&mesh, &peer, &pipe).await;
    let exchange = link.exchange().unwrap();
    let before = exchange.at();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let link = link.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..500 {
                    assert!(link.sync());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(exchange.at(), before + 8 * 500);
}

#[tokio::test]
async fn first_pipe_to_answer_after_sync_ranks_first() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let a = MemoryPipe::new(udp(1));
    let b = MemoryPipe::new(udp(2));
    let link = linked(&mesh, &peer, &a).await;
    link.add_pipe(a.clone(), true);
    link.add_pipe(b.clone(), true);
    tick().await;

    link.sync();
    tick().await;
    assert!(link.add_pipe(b.clone(), true));
    tick().await;
    assert!(link.add_pipe(a.clone(), true));

    assert_eq!(link.best_pipe().unwrap().id(), b.id());
    assert!(!link.add_pipe(a.clone(), true), "already fresh");
}

#[tokio::test]
async fn keepalive_event_triggers_sync() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = linked(&mesh, &peer, &pipe).await;
    let before = link.exchange().unwrap().at();

    assert_eq!(pipe.emit(PipeEvent::Keepalive), 1);

    assert_eq!(link.exchange().unwrap().at(), before + 1);
}

#[tokio::test(start_paused = true)]
async fn keepalive_timer_drives_periodic_resync() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::with_keepalive(udp(42424), Duration::from_secs(30));
    let link = linked(&mesh, &peer, &pipe).await;
    let before = link.exchange().unwrap().at();

    let shared: Arc<dyn Pipe> = pipe.clone();
    let timer = spawn_keepalive(Arc::downgrade(&shared), pipe.keepalive().unwrap());
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(link.exchange().unwrap().at(), before + 2);
    timer.abort();
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_status_observer_is_told_current_status_once() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = linked(&mesh, &peer, &pipe).await;
    link.add_pipe(pipe.clone(), true);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let observer: Arc<dyn StatusObserver> = Arc::new(move |_: &Link, status: &LinkStatus| {
        let _ = tx.send(status.clone());
    });

    assert_eq!(link.on_status(observer.clone()), LinkStatus::Up);
    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert_eq!(first, Some(LinkStatus::Up));

    assert_eq!(link.on_status(observer), LinkStatus::Up);
    link.close();
    assert_eq!(rx.recv().await, Some(LinkStatus::Down("no pipes".into())));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn mesh_events_follow_link_status() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let mut events = mesh.subscribe();
    let link = linked(&mesh, &peer, &pipe).await;

    link.add_pipe(pipe.clone(), true);
    link.close();

    assert_eq!(events.recv().await.unwrap(), MeshEvent::Link(peer.hashname()));
    assert_eq!(events.recv().await.unwrap(), MeshEvent::Down(peer.hashname()));
}

// ---------------------------------------------------------------------------
// Paths and routers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resolver_turns_paths_into_pipes() {
    let local = FakeIdentity::new(1);
    let resolver = MemoryResolver::new("udp4");
    let mesh = Mesh::builder(local.clone()).path_resolver(resolver.clone()).build();
    let peer = FakePeer::new(2, &local);
    let link = mesh.link(LinkArgs::keys(peer.keys())).await.unwrap();

    assert_eq!(link.add_path(udp(42424)).await, 1);
    assert_eq!(link.add_path(Path::new("tcp4").with("port", 1)).await, 0);

    assert_eq!(link.pipes().len(), 1);
    assert_eq!(link.paths().len(), 2);
    let created = resolver.created();
    assert!(created[0].wait_for_sent(1, WAIT).await);
}

#[tokio::test]
async fn peer_path_to_self_is_skipped() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let link = mesh.link(LinkArgs::keys(peer.keys())).await.unwrap();

    assert_eq!(link.add_path(Path::peer(&peer.hashname())).await, 0);
    assert!(link.paths().is_empty());
}

#[tokio::test]
async fn default_router_adds_peer_paths_to_other_links() {
    let (mesh, local) = fake_mesh(1);
    let early = FakePeer::new(2, &local);
    let router = FakePeer::new(3, &local);
    let late = FakePeer::new(4, &local);

    let early_link = mesh.link(LinkArgs::keys(early.keys())).await.unwrap();
    let mut args = LinkArgs::keys(router.keys());
    args.router = Some(true);
    let router_link = mesh.link(args).await.unwrap();
    let late_link = mesh.link(LinkArgs::keys(late.keys())).await.unwrap();

    let via = Path::peer(&router.hashname());
    assert!(early_link.paths().contains(&via));
    assert!(late_link.paths().contains(&via));
    assert!(!router_link.paths().contains(&via));

    mesh.set_router(&router_link, false).await;
    assert!(mesh.routers().is_empty());
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_channel_sends_type_and_id() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = mesh.link(LinkArgs::keys(peer.keys())).await.unwrap();
    link.add_pipe(pipe.clone(), true);

    let channel = link
        .open_channel("chat", json_map(json!({"seq": 0})), b"hi".to_vec())
        .await
        .unwrap();

    let open = peer.read_all(&pipe).pop().unwrap();
    assert_eq!(open.json_str("type"), Some("chat"));
    assert_eq!(open.json_u32("c"), Some(channel.id()));
    assert_eq!(open.body, b"hi");
    assert_eq!(link.channel_count(), 1);
}

#[tokio::test]
async fn closed_channel_refuses_to_send() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = mesh.link(LinkArgs::keys(peer.keys())).await.unwrap();
    link.add_pipe(pipe.clone(), true);
    let channel = link.open_channel("chat", Default::default(), Vec::new()).await.unwrap();

    channel.close().await.unwrap();

    let end = peer.read_all(&pipe).pop().unwrap();
    assert!(end.has_key("end"));
    assert!(channel.is_gone());
    let result = channel.send(Default::default(), Vec::new()).await;
    assert!(matches!(result, Err(MeshError::ChannelGone(id)) if id == channel.id()));
}

#[tokio::test]
async fn open_channel_without_pipes_fails() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let link = mesh.link(LinkArgs::keys(peer.keys())).await.unwrap();

    let result = link.open_channel("chat", Default::default(), Vec::new()).await;

    assert!(matches!(result, Err(MeshError::NoPipes(_))));
    assert_eq!(link.channel_count(), 0);
}

#[tokio::test]
async fn link_down_ends_channels() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = mesh.link(LinkArgs::keys(peer.keys())).await.unwrap();
    link.add_pipe(pipe.clone(), true);
    let channel = link.open_channel("chat", Default::default(), Vec::new()).await.unwrap();

    link.close();

    assert!(channel.is_gone());
    assert_eq!(link.channel_count(), 0);
    assert_eq!(channel.recv().await, None);
}

#[tokio::test]
async fn ended_channels_are_retired() {
    let (mesh, local) = fake_mesh(1);
    let peer = FakePeer::new(2, &local);
    let pipe = MemoryPipe::new(udp(42424));
    let link = mesh.link(LinkArgs::keys(peer.keys())).await.unwrap();
    link.add_pipe(pipe.clone(), true);

    let mut ids = Vec::new();
    for _ in 0..300 {
        let channel = link.open_channel("chat", Default::default(), Vec::new()).await.unwrap();
        channel.close().await.unwrap();
        ids.push(channel.id());
    }

    assert!(link.is_up());
    assert_eq!(link.channel_count(), 0);
    assert!(link.is_retired(ids[299]));
    assert!(!link.is_retired(ids[0]), "only recent ids are remembered");
}
