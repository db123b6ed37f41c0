//! Live clusters on distinct port ranges.

use std::time::Duration;

use quorumlab_cluster::{Cluster, ClusterConfig, ClusterError, MemberState};

fn config(dir: &std::path::Path, size: usize, root_port: u16) -> ClusterConfig {
    ClusterConfig::new(size, dir.join("lab"))
        .with_root_port(root_port)
        .with_raft_timing(50, 150, 300)
        .with_status_interval(Duration::from_millis(200))
}

/// Refresh until every member reports the same non-zero hash.
async fn converged_hashes(cluster: &Cluster) -> Vec<u32> {
    for _ in 0..40 {
        cluster.refresh_status().await;
        let hashes: Vec<u32> = cluster.all_member_status().iter().map(|s| s.hash).collect();
        if hashes[0] != 0 && hashes.iter().all(|h| *h == hashes[0]) {
            return hashes;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("hashes did not converge: {:?}", cluster.all_member_status());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_stop_restart_keeps_hash() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(config(dir.path(), 5, 45100)).await.unwrap();
    assert_eq!(cluster.size(), 5);
    assert_eq!(cluster.quorum(), 3);
    assert!(cluster.lead_idx().is_some());

    cluster.client(0).unwrap().put("foo", "bar").await.unwrap();
    let before = converged_hashes(&cluster).await[0];

    cluster.stop(0).await.unwrap();
    let status = cluster.member_status(0).unwrap();
    assert_eq!(status.state, MemberState::Stopped);
    assert_eq!((status.db_size, status.hash, status.is_leader), (0, 0, false));
    assert!(cluster.is_stopped(0).unwrap());
    assert_eq!(cluster.active_node_n(), 4);

    for i in 1..5 {
        tokio::time::timeout(Duration::from_secs(30), cluster.wait_for_leader(i))
            .await
            .expect("no leader among the remaining members")
            .unwrap();
    }

    cluster.restart(0).await.unwrap();
    assert_eq!(cluster.member_status(0).unwrap().state, MemberState::Follower);

    let after = converged_hashes(&cluster).await;
    assert_eq!(after[0], before);
    assert_eq!(cluster.active_node_n(), 5);

    let root_dir = dir.path().join("lab");
    cluster.shutdown().await.unwrap();
    assert!(!root_dir.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_repeated_stop_and_restart_are_noops() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(config(dir.path(), 3, 45200).with_embedded_client(true))
        .await
        .unwrap();

    cluster.stop(2).await.unwrap();
    let stopped_at = cluster.stopped_started_at(2).unwrap();

    cluster.stop(2).await.unwrap();
    assert_eq!(cluster.stopped_started_at(2).unwrap(), stopped_at);
    let status = cluster.member_status(2).unwrap();
    assert_eq!(status.state, MemberState::Stopped);
    assert_eq!((status.db_size, status.hash), (0, 0));

    cluster.restart(2).await.unwrap();
    let started_at = cluster.stopped_started_at(2).unwrap();
    assert!(started_at > stopped_at);

    cluster.restart(2).await.unwrap();
    assert_eq!(cluster.stopped_started_at(2).unwrap(), started_at);
    assert_eq!(cluster.member_status(2).unwrap().state, MemberState::Follower);

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_add_then_remove_restores_layout() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(config(dir.path(), 3, 45300)).await.unwrap();
    let endpoints = cluster.all_endpoints(false);
    let initial_cluster = cluster.initial_cluster();

    let index = cluster.add().await.unwrap();
    assert_eq!(index, 3);
    assert_eq!(cluster.size(), 4);
    assert_eq!(cluster.quorum(), 3);
    let added = cluster.endpoints(index, false).unwrap().remove(0);
    assert_eq!(added, "127.0.0.1:45306");
    assert_eq!(cluster.find_index(&added), Some(3));
    assert_eq!(cluster.find_index("tcp://127.0.0.1:45306"), Some(3));
    assert!(cluster.initial_cluster().ends_with("node4=tcp://127.0.0.1:45307"));

    cluster.client(0).unwrap().put("k", "v").await.unwrap();
    converged_hashes(&cluster).await;

    let added_dir = cluster.config(index).unwrap().data_dir;
    cluster.remove(index).await.unwrap();
    assert_eq!(cluster.size(), 3);
    assert_eq!(cluster.all_endpoints(false), endpoints);
    assert_eq!(cluster.initial_cluster(), initial_cluster);
    assert_eq!(cluster.find_index(&added), None);
    for (i, ep) in endpoints.iter().enumerate() {
        assert_eq!(cluster.find_index(ep), Some(i));
    }
    assert!(!added_dir.exists());

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_remove_reindexes_survivors() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(config(dir.path(), 3, 45400)).await.unwrap();
    let last = cluster.endpoints(2, true).unwrap().remove(0);

    cluster.remove(0).await.unwrap();
    assert_eq!(cluster.size(), 2);
    assert_eq!(cluster.find_index(&last), Some(1));
    assert_eq!(cluster.member_status(0).unwrap().name, "node2");
    assert!(matches!(cluster.member_status(2), Err(ClusterError::NotFound(_))));

    cluster.client(0).unwrap().put("after", "remove").await.unwrap();
    converged_hashes(&cluster).await;

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = Cluster::start(config(dir.path(), 8, 45500)).await.unwrap_err();
    assert!(matches!(err, ClusterError::Config(_)));
    assert!(!dir.path().join("lab").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_loop_refreshes_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(config(dir.path(), 1, 45600)).await.unwrap();
    assert_eq!(cluster.quorum(), 1);
    assert_eq!(cluster.lead_idx(), Some(0));

    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = cluster.member_status(0).unwrap();
    assert_eq!(status.state, MemberState::Leader);
    assert!(status.db_size > 0);
    assert!(status.state_txt.starts_with("node1 has been healthy"));

    cluster.shutdown().await.unwrap();
    assert!(cluster.root().is_cancelled());
    assert!(cluster.is_stopped(0).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_root_cancel_ends_leader_wait_without_quorum() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(config(dir.path(), 3, 45900)).await.unwrap();
    cluster.stop(1).await.unwrap();
    cluster.stop(2).await.unwrap();
    assert_eq!(cluster.active_node_n(), 1);

    let waiting = tokio::spawn({
        let cluster = cluster.clone();
        async move { cluster.wait_for_leader(0).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiting.is_finished());

    cluster.root().cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("leader wait ignored the root token")
        .unwrap();
    assert!(matches!(result, Err(ClusterError::Canceled)));

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_failed_add_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(config(dir.path(), 3, 46000)).await.unwrap();
    let endpoints = cluster.all_endpoints(false);

    // node4 would listen for clients here.
    let busy = std::net::TcpListener::bind("127.0.0.1:46006").unwrap();
    let err = cluster.add().await.unwrap_err();
    assert!(matches!(err, ClusterError::Start { .. }), "{}", err);
    assert_eq!(cluster.size(), 3);
    assert_eq!(cluster.all_endpoints(false), endpoints);
    assert_eq!(cluster.find_index("127.0.0.1:46006"), None);
    assert!(!dir.path().join("lab").join("node4.data").exists());
    drop(busy);

    // IDs are not reused, so the next member gets fresh ports.
    let index = cluster.add().await.unwrap();
    assert_eq!(index, 3);
    assert_eq!(cluster.member_status(index).unwrap().name, "node5");
    assert_eq!(cluster.endpoints(index, false).unwrap()[0], "127.0.0.1:46008");

    cluster.client(0).unwrap().put("after", "rollback").await.unwrap();
    converged_hashes(&cluster).await;

    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_failed_start_releases_every_port() {
    let dir = tempfile::tempdir().unwrap();

    // node2 cannot bind its client port.
    let busy = std::net::TcpListener::bind("127.0.0.1:46102").unwrap();
    let err = Cluster::start(config(dir.path(), 3, 46100)).await.unwrap_err();
    assert!(
        matches!(&err, ClusterError::Start { name, .. } if name == "node2"),
        "{}",
        err
    );
    assert!(!dir.path().join("lab").exists());
    drop(busy);

    for port in 46100..46106 {
        std::net::TcpListener::bind(("127.0.0.1", port))
            .unwrap_or_else(|e| panic!("port {} still held: {}", port, e));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_remove_survives_undeletable_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(config(dir.path(), 3, 46200)).await.unwrap();
    let removed = cluster.endpoints(1, true).unwrap().remove(0);
    let last = cluster.endpoints(2, true).unwrap().remove(0);

    // The running node keeps its files under the new name; a plain file
    // now sits where its directory was.
    let data_dir = cluster.config(1).unwrap().data_dir;
    std::fs::rename(&data_dir, data_dir.with_extension("moved")).unwrap();
    std::fs::write(&data_dir, b"not a directory").unwrap();

    cluster.remove(1).await.unwrap();
    assert_eq!(cluster.size(), 2);
    assert_eq!(cluster.find_index(&removed), None);
    assert_eq!(cluster.find_index(&last), Some(1));
    assert_eq!(cluster.member_status(1).unwrap().name, "node3");
    assert!(data_dir.is_file());

    cluster.client(0).unwrap().put("after", "remove").await.unwrap();
    converged_hashes(&cluster).await;

    cluster.shutdown().await.unwrap();
    assert!(!dir.path().join("lab").exists());
}
