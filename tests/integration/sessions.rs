use connhub::{EventDetails, HubEventKind, PeerState, PeerType, Session};

use crate::*;

#[tokio::test]
async fn test_connect_and_inbound_synthesis() -> Result<()> {
    let a = spawn_node(test_config()).await?;
    let b = spawn_node(test_config()).await?;
    let mut a_events = a.hub.listen()?;
    let mut b_events = b.hub.listen()?;

    let session = a.hub.connect(&b.address()).await?.context("expected a session")?;
    assert_eq!(session.peer_key(), b.key());

    assert_eq!(next_event(&mut a_events).await?.kind, HubEventKind::Connecting);
    let connected = next_event(&mut a_events).await?;
    assert_eq!(connected.kind, HubEventKind::Connected);
    assert!(matches!(
        connected.details,
        Some(EventDetails::Session { initiator: true, .. })
    ));

    let entries = a.hub.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, b.address());
    assert_eq!(entries[0].1.state, PeerState::Connected);
    assert_eq!(entries[0].1.key.as_deref(), Some(b.key()));
    assert_eq!(entries[0].1.inferred_type, Some(PeerType::Lan));

    // B never called connect(); its record is synthesized from the session.
    let inbound = wait_for(&mut b_events, HubEventKind::Connected).await?;
    assert!(matches!(
        inbound.details,
        Some(EventDetails::Session { initiator: false, .. })
    ));
    assert_eq!(inbound.key.as_deref(), Some(a.key()));
    let b_entries = b.hub.entries();
    assert_eq!(b_entries.len(), 1);
    assert!(b_entries[0].0.starts_with("net:127.0.0.1:"));
    assert_eq!(b_entries[0].1.state, PeerState::Connected);

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_reaches_both_sides() -> Result<()> {
    let a = spawn_node(test_config()).await?;
    let b = spawn_node(test_config()).await?;
    let mut b_events = b.hub.listen()?;
    a.hub.connect(&b.address()).await?;
    wait_for(&mut b_events, HubEventKind::Connected).await?;
    let mut a_events = a.hub.listen()?;

    assert!(a.hub.disconnect(&b.address()).await?);

    assert_eq!(next_event(&mut a_events).await?.kind, HubEventKind::Disconnecting);
    assert_eq!(next_event(&mut a_events).await?.kind, HubEventKind::Disconnected);
    assert!(a.hub.entries().is_empty());

    let gone = wait_for(&mut b_events, HubEventKind::Disconnected).await?;
    assert_eq!(gone.key.as_deref(), Some(a.key()));
    assert!(b.hub.entries().is_empty());

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_connects_share_one_session() -> Result<()> {
    let a = spawn_node(test_config()).await?;
    let b = spawn_node(test_config()).await?;
    let addr = b.address();

    let (first, second) = tokio::join!(a.hub.connect(&addr), a.hub.connect(&addr));
    let sessions = [first?, second?];

    assert_eq!(sessions.iter().filter(|s| s.is_some()).count(), 1);
    assert_eq!(a.hub.entries().len(), 1);
    eventually(|| connhub::Transport::sessions(a.transport.as_ref()).len() == 1).await?;

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_reset_drops_every_peer() -> Result<()> {
    let a = spawn_node(test_config()).await?;
    let b = spawn_node(test_config()).await?;
    let c = spawn_node(test_config()).await?;
    a.hub.connect(&b.address()).await?;
    a.hub.connect(&c.address()).await?;
    assert_eq!(a.hub.entries().len(), 2);

    a.hub.reset()?;

    eventually(|| a.hub.entries().is_empty()).await?;
    eventually(|| b.hub.entries().is_empty() && c.hub.entries().is_empty()).await?;

    a.stop().await;
    b.stop().await;
    c.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_not_ready_responder_drops_session() -> Result<()> {
    let a = spawn_node(test_config()).await?;
    let b = spawn_node(test_config()).await?;
    b.transport.set_ready(false);
    let mut a_events = a.hub.listen()?;

    a.hub.connect(&b.address()).await?;

    wait_for(&mut a_events, HubEventKind::Disconnected).await?;
    assert_eq!(a.hub.get_state(&b.address()), None);
    assert!(b.hub.entries().is_empty());

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_keepalive_probe_pings_peer() -> Result<()> {
    let mut config = test_config();
    config.ping.enabled = true;
    config.ping.interval_secs = 1;
    config.ping.timeout_secs = 2;
    let a = spawn_node(config).await?;
    let b = spawn_node(test_config()).await?;
    let mut a_events = a.hub.listen()?;

    a.hub.connect(&b.address()).await?;

    let ping = wait_for(&mut a_events, HubEventKind::Ping).await?;
    let probe = ping.probe().context("ping event carries the probe")?.clone();
    eventually(|| probe.pings() >= 1).await?;
    assert_eq!(probe.failures(), 0);
    assert!(probe.last_rtt().is_some());

    a.stop().await;
    b.stop().await;
    Ok(())
}
