mod common;

use std::sync::Arc;
use std::time::Duration;

use blind_fusion::server::spawn;
use blind_fusion::{
    Coordinator, FusionClient, FusionConfig, FusionError, LocalTransport, Participant,
};
use common::{signer, wallet, RecordingBroadcaster, COIN};

fn fast_config() -> FusionConfig {
    FusionConfig {
        min_players: 3,
        max_players: 3,
        tick_interval_ms: 20,
        transport_retry_delay_ms: 10,
        ..FusionConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_clients_mix_over_the_server() {
    common::init_tracing();
    let config = fast_config();
    let coordinator = Coordinator::new(config.clone(), signer()).expect("coordinator");
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let (handle, task) = spawn(coordinator, broadcaster.clone());

    let mut clients = Vec::new();
    for _ in 0..3 {
        let transport = LocalTransport::connect(handle.clone()).await.expect("connect");
        let participant = Participant::consolidating(wallet(&[COIN]), config.fee_rate);
        let mut client = FusionClient::new(transport, participant, &config).with_max_sessions(2);
        clients.push(tokio::spawn(async move { client.run().await }));
    }

    let mut txids = Vec::new();
    for client in clients {
        let txid = tokio::time::timeout(Duration::from_secs(60), client)
            .await
            .expect("client finished in time")
            .expect("client task")
            .expect("mix succeeded");
        txids.push(txid);
    }
    assert!(txids.windows(2).all(|w| w[0] == w[1]));

    {
        let sent = broadcaster.sent.lock().expect("broadcaster lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tx.inputs.len(), 3);
        assert_eq!(sent[0].tx.outputs.len(), 3);
        assert_eq!(sent[0].txid(), txids[0]);
    }

    handle.shutdown().await;
    task.await.expect("server task");
    assert!(matches!(
        LocalTransport::connect(handle).await,
        Err(FusionError::Transport(_))
    ));
}

#[tokio::test]
async fn unseated_player_cannot_speak_for_a_seat() {
    common::init_tracing();
    let config = fast_config();
    let coordinator = Coordinator::new(config.clone(), signer()).expect("coordinator");
    let (handle, task) = spawn(coordinator, Arc::new(RecordingBroadcaster::default()));

    let mut seated = Vec::new();
    for _ in 0..3 {
        let (player, notices) = handle.connect().await.expect("connect");
        let participant = Participant::consolidating(wallet(&[COIN]), config.fee_rate);
        handle
            .join_tier(player, participant.join_request())
            .await
            .expect("join");
        seated.push((player, notices, participant));
    }

    let (player, notices, participant) = &mut seated[0];
    let invite = match tokio::time::timeout(Duration::from_secs(10), notices.recv()).await {
        Ok(Some(blind_fusion::Notice::SessionStarted(invite))) => invite,
        other => panic!("expected an invite, got {:?}", other),
    };
    let registration = participant
        .commit_inputs(&invite, &mut rand::thread_rng())
        .expect("commit");

    let (outsider, _outsider_notices) = handle.connect().await.expect("connect");
    assert_eq!(
        handle
            .register(outsider, invite.session, invite.handle, registration.clone())
            .await,
        Err(FusionError::UnknownParticipant)
    );
    assert!(handle
        .register(*player, invite.session, invite.handle, registration)
        .await
        .is_ok());

    handle.shutdown().await;
    task.await.expect("server task");
}
