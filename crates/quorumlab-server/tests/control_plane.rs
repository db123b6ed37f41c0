//! Guards of the control plane against a live three-member cluster.

use std::time::Duration;

use quorumlab_cluster::{Cluster, ClusterConfig, ClusterError, MemberState};
use quorumlab_server::{Command, CommandResult, ControlPlane, Error, LimitConfig, Resource};

fn limits() -> LimitConfig {
    LimitConfig {
        stop_restart: Duration::from_secs(30),
        membership: Duration::from_secs(30),
        write: Duration::ZERO,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_stop_is_guarded() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig::new(3, dir.path().join("lab"))
        .with_root_port(45700)
        .with_raft_timing(50, 150, 300)
        .with_status_interval(Duration::from_millis(200));
    let cluster = Cluster::start(config).await.unwrap();
    let control = ControlPlane::new(cluster.clone(), &limits());

    assert_eq!(control.stop(0).await.unwrap(), "stopped node1");
    assert_eq!(cluster.member_status(0).unwrap().state, MemberState::Stopped);

    // Already stopped, refused before the limiter is consulted.
    let err = control.stop(0).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Cluster(ClusterError::AlreadyInState { state: MemberState::Stopped, .. })
    ));

    // Two of three active and quorum is two.
    let err = control.stop(1).await.unwrap_err();
    assert!(matches!(err, Error::Quorum(_)), "{}", err);
    assert_eq!(cluster.active_node_n(), 2);

    // The stop above consumed the only token.
    let err = control.restart(0).await.unwrap_err();
    match err {
        Error::RateLimited(msg) => assert!(msg.starts_with("rate limit exceeded"), "{}", msg),
        other => panic!("expected rate limit, got {}", other),
    }
    assert!(cluster.is_stopped(0).unwrap());

    control.set_interval(Resource::StopRestart, Duration::ZERO);
    assert_eq!(control.restart(0).await.unwrap(), "restarted node1");
    let err = control.restart(0).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Cluster(ClusterError::AlreadyInState { .. })
    ));

    cluster.shutdown().await.unwrap();
    assert!(matches!(control.add().await, Err(Error::RateLimited(msg)) if msg == "root context canceled"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_console_commands() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig::new(3, dir.path().join("lab"))
        .with_root_port(45800)
        .with_raft_timing(50, 150, 300)
        .with_embedded_client(true);
    let cluster = Cluster::start(config).await.unwrap();
    let control = ControlPlane::new(cluster.clone(), &limits());

    let run = |line: &str| Command::parse(line).unwrap().unwrap();

    assert_eq!(
        run("put 0 greeting hello").execute(&control).await,
        CommandResult::Output("OK".to_string())
    );
    assert_eq!(
        run("put 1 greeting hi there").execute(&control).await,
        CommandResult::Output("OK (previous value \"hello\")".to_string())
    );
    assert_eq!(
        run("get 2 greeting").execute(&control).await,
        CommandResult::Output("hi there".to_string())
    );
    assert_eq!(
        run("delete 0 greeting").execute(&control).await,
        CommandResult::Output("OK".to_string())
    );
    assert_eq!(
        run("delete 0 greeting").execute(&control).await,
        CommandResult::Output("greeting not found".to_string())
    );

    match run("status").execute(&control).await {
        CommandResult::Output(json) => {
            let statuses: serde_json::Value = serde_json::from_str(&json).unwrap();
            assert_eq!(statuses.as_array().unwrap().len(), 3);
            assert_eq!(statuses[0]["Name"], "node1");
        }
        other => panic!("unexpected {:?}", other),
    }

    match run("endpoints").execute(&control).await {
        CommandResult::Output(out) => assert!(out.starts_with("0  tcp://127.0.0.1:45800")),
        other => panic!("unexpected {:?}", other),
    }

    match run("stop 7").execute(&control).await {
        CommandResult::Output(out) => assert!(out.starts_with("Error:"), "{}", out),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(run("exit").execute(&control).await, CommandResult::Exit);

    cluster.shutdown().await.unwrap();
}
