use std::{num::NonZeroU64, sync::Arc, time::Duration};

use tokio_test::assert_ok;

use collab_averaging::{
    CoordinatorBuilder, CoordinatorConfig, StepOutcome,
    averaging::Contribution,
    optimization::GradientDescent,
    transport::{PeerId, PeerTransport, StateSnapshot, TcpTransport},
};

fn config(initial_peers: Vec<String>) -> CoordinatorConfig {
    CoordinatorConfig {
        run_id: "tcp_run".into(),
        host_addrs: vec!["127.0.0.1:0".into()],
        initial_peers,
        ..CoordinatorConfig::new(NonZeroU64::new(100).unwrap())
    }
}

async fn pair() -> (TcpTransport, TcpTransport) {
    let a = TcpTransport::bind(PeerId::new("a"), &config(Vec::new())).await.unwrap();
    let b = TcpTransport::bind(PeerId::new("b"), &config(a.visible_addrs())).await.unwrap();

    wait_for(|| a.reachable_peers() == vec![PeerId::new("b")]).await;
    assert_eq!(b.reachable_peers(), vec![PeerId::new("a")]);
    (a, b)
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn contribution(peer: &str, gradient: Vec<f32>) -> Contribution {
    Contribution {
        peer: PeerId::new(peer),
        run_id: "tcp_run".into(),
        epoch: 0,
        samples: 10,
        gradient,
        parameters: Some(vec![0.5, 0.5]),
    }
}

#[tokio::test]
async fn peers_exchange_contributions() {
    let (a, b) = pair().await;
    let timeout = Duration::from_secs(5);

    let (ra, rb) = tokio::join!(
        a.exchange(contribution("a", vec![1.0, 2.0]), vec![PeerId::new("b")], timeout),
        b.exchange(contribution("b", vec![3.0, 4.0]), vec![PeerId::new("a")], timeout),
    );

    assert_eq!(ra.unwrap(), vec![contribution("b", vec![3.0, 4.0])]);
    assert_eq!(rb.unwrap(), vec![contribution("a", vec![1.0, 2.0])]);
}

#[tokio::test]
async fn hello_announces_listen_addresses() {
    let (a, b) = pair().await;
    assert_eq!(b.peer_addrs(), vec![(PeerId::new("a"), a.visible_addrs())]);
    assert_eq!(a.peer_addrs(), vec![(PeerId::new("b"), b.visible_addrs())]);
}

#[tokio::test]
async fn state_is_served_to_peers() {
    let (a, b) = pair().await;
    let state = StateSnapshot {
        peer: PeerId::new("a"),
        run_id: "tcp_run".into(),
        epoch: 4,
        parameters: vec![1.0, 2.0],
    };
    assert_ok!(a.publish_state(state.clone()).await);

    let fetched = b.fetch_state(Duration::from_secs(5)).await.unwrap();
    assert_eq!(fetched, Some(state));
}

#[tokio::test]
async fn other_runs_are_refused() {
    let a = TcpTransport::bind(PeerId::new("a"), &config(Vec::new())).await.unwrap();
    let other = CoordinatorConfig {
        run_id: "another_run".into(),
        ..config(a.visible_addrs())
    };
    let b = TcpTransport::bind(PeerId::new("b"), &other).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.reachable_peers().is_empty());
    assert!(b.reachable_peers().is_empty());
}

#[tokio::test]
async fn shutdown_is_seen_by_peers() {
    let (a, b) = pair().await;
    a.shutdown().await;
    wait_for(|| b.reachable_peers().is_empty()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coordinators_step_together_over_tcp() {
    let (a, b) = pair().await;

    let build = |transport: TcpTransport| {
        CoordinatorBuilder::new(config(Vec::new()))
            .optimizer(vec![0.0, 0.0], GradientDescent::new(0.1))
            .build(Arc::new(transport))
            .unwrap()
    };
    let mut a = build(a);
    let mut b = build(b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    assert_eq!(
        a.step(&[1.0, 1.0], 60).await.unwrap(),
        StepOutcome::Accumulated { samples: 60 }
    );

    // Progress travels asynchronously, wait until b sees a's samples.
    let b = tokio::spawn(async move {
        loop {
            match b.step(&[2.0, 2.0], 10).await.unwrap() {
                StepOutcome::Accumulated { .. } => tokio::time::sleep(Duration::from_millis(5)).await,
                outcome => return (b, outcome),
            }
        }
    });

    let outcome = loop {
        match a.poll().await.unwrap() {
            StepOutcome::Accumulated { .. } => tokio::time::sleep(Duration::from_millis(5)).await,
            outcome => break outcome,
        }
    };
    let (mut b, b_outcome) = b.await.unwrap();

    assert!(matches!(outcome, StepOutcome::Stepped { epoch: 1, peers: 2, .. }));
    assert_eq!(outcome, b_outcome);
    assert_eq!(a.parameters(), b.parameters());

    assert_ok!(a.stop().await);
    assert_ok!(b.stop().await);
}
