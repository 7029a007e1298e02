mod common;
use common::*;

use ecu_proxy::ecu::listener::ListenerSet;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn listener_config(ports: Vec<u16>) -> config::Listener {
    config::Listener {
        host: "127.0.0.1".to_string(),
        ports,
        ..Default::default()
    }
}

#[tokio::test]
async fn binds_every_port() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let mut from_ecu = channels.from_ecu.subscribe();

    let listeners = ListenerSet::new(
        &listener_config(vec![0, 0, 0]),
        handler(None, &channels, &stats),
        stats.clone(),
    );
    let bound = listeners.start().await;
    assert_eq!(bound.len(), 3);

    for addr in &bound {
        let mut client = TcpStream::connect(addr).await?;
        client.write_all(&Factory::frame().build()).await?;
        next_reading(&mut from_ecu).await?;
    }

    let accepted = stats.lock().map(|s| s.connections_accepted).unwrap_or_default();
    assert_eq!(accepted, 3);

    listeners.stop().await;

    Ok(())
}

#[tokio::test]
async fn bind_failure_leaves_other_ports_serving() -> Result<()> {
    common_setup();

    let occupied = std::net::TcpListener::bind("127.0.0.1:0")?;
    let occupied_port = occupied.local_addr()?.port();

    let channels = Channels::new();
    let stats = stats();
    let mut from_ecu = channels.from_ecu.subscribe();

    let listeners = ListenerSet::new(
        &listener_config(vec![occupied_port, 0]),
        handler(None, &channels, &stats),
        stats.clone(),
    );
    let bound = listeners.start().await;
    assert_eq!(bound.len(), 1);
    assert_ne!(bound[0].port(), occupied_port);

    let bind_failures = stats.lock().map(|s| s.bind_failures).unwrap_or_default();
    assert_eq!(bind_failures, 1);

    let mut client = TcpStream::connect(bound[0]).await?;
    client.write_all(&Factory::frame().build()).await?;
    next_reading(&mut from_ecu).await?;

    listeners.stop().await;

    Ok(())
}

#[tokio::test]
async fn stop_closes_listening_sockets() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();

    let listeners = ListenerSet::new(
        &listener_config(vec![0]),
        handler(None, &channels, &stats),
        stats.clone(),
    );
    let bound = listeners.start().await;
    assert_eq!(bound.len(), 1);

    listeners.stop().await;

    assert!(TcpStream::connect(bound[0]).await.is_err());

    Ok(())
}

#[tokio::test]
async fn open_connections_survive_stop() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let mut from_ecu = channels.from_ecu.subscribe();

    let listeners = ListenerSet::new(
        &listener_config(vec![0]),
        handler(None, &channels, &stats),
        stats.clone(),
    );
    let bound = listeners.start().await;

    let mut client = TcpStream::connect(bound[0]).await?;
    client.write_all(&Factory::frame().build()).await?;
    next_reading(&mut from_ecu).await?;

    listeners.stop().await;

    client
        .write_all(&Factory::frame().ecu_id("216200012345").build())
        .await?;
    let reading = next_reading(&mut from_ecu).await?;
    assert_eq!(reading.ecu_model, "ECU-R Pro");

    Ok(())
}

#[tokio::test]
async fn connection_limit_drops_extra_sockets() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let mut from_ecu = channels.from_ecu.subscribe();

    let config = config::Listener {
        max_connections: Some(1),
        ..listener_config(vec![0])
    };
    let listeners = ListenerSet::new(&config, handler(None, &channels, &stats), stats.clone());
    let bound = listeners.start().await;

    let mut first = TcpStream::connect(bound[0]).await?;
    first.write_all(&Factory::frame().build()).await?;
    next_reading(&mut from_ecu).await?;

    let mut second = TcpStream::connect(bound[0]).await?;
    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf)).await?;
    assert!(matches!(closed, Ok(0) | Err(_)));

    let active = stats.lock().map(|s| s.connections_active).unwrap_or_default();
    assert_eq!(active, 1);

    listeners.stop().await;

    Ok(())
}
