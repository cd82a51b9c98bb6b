use std::io;

use connhub::{HubError, HubEventKind, PeerState};

use crate::*;

#[tokio::test]
async fn test_unreachable_peer_fails_cleanly() -> Result<()> {
    let node = spawn_node(test_config()).await?;
    let addr = dead_address().await?;
    let mut events = node.hub.listen()?;

    let err = node.hub.connect(&addr).await.unwrap_err();

    let kind = err.transport().and_then(|e| e.io_kind());
    assert_eq!(kind, Some(io::ErrorKind::ConnectionRefused), "{err}");
    assert_eq!(node.hub.get_state(&addr), None);
    assert!(node.hub.entries().is_empty());

    let connecting = next_event(&mut events).await?;
    assert_eq!(connecting.kind, HubEventKind::Connecting);
    let failed = next_event(&mut events).await?;
    assert_eq!(failed.kind, HubEventKind::ConnectingFailed);
    assert_eq!(failed.address, connecting.address);
    assert_eq!(failed.key, connecting.key);
    assert!(failed.error().is_some());

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_live_entries_during_failed_connect() -> Result<()> {
    let node = spawn_node(test_config()).await?;
    let addr = dead_address().await?;
    let mut live = node.hub.live_entries()?;

    assert!(live.recv().await.context("initial snapshot")?.is_empty());
    let _ = node.hub.connect(&addr).await;

    let during = live.recv().await.context("connecting snapshot")?;
    assert_eq!(during.len(), 1);
    assert_eq!(during[0].0, addr);
    assert_eq!(during[0].1.state, PeerState::Connecting);
    assert!(live.recv().await.context("final snapshot")?.is_empty());

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_bad_addresses_are_rejected() -> Result<()> {
    let node = spawn_node(test_config()).await?;

    for bad in ["", "not an address", "dht:seed:", "DHT:seed:remote~noauth"] {
        let err = node.hub.connect(bad).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidAddress(_)), "{bad:?}: {err}");
    }
    assert!(node.hub.entries().is_empty());

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_unknown_is_noop() -> Result<()> {
    let node = spawn_node(test_config()).await?;
    assert!(!node.hub.disconnect(&dead_address().await?).await?);
    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_closed_hub_refuses_work() -> Result<()> {
    let node = spawn_node(test_config()).await?;
    let mut events = node.hub.listen()?;
    let mut live = node.hub.live_entries()?;
    live.recv().await;

    node.hub.close();

    assert!(events.recv().await.is_none());
    assert!(live.recv().await.is_none());
    let addr = dead_address().await?;
    assert!(matches!(node.hub.connect(&addr).await, Err(HubError::Closed)));
    assert!(matches!(node.hub.listen(), Err(HubError::Closed)));
    assert!(node.hub.entries().is_empty());

    node.stop().await;
    Ok(())
}
