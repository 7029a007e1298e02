mod common;
use common::*;

use async_trait::async_trait;
use bytes::Bytes;
use ecu_proxy::ecu::connection::ConnectionHandler;
use ecu_proxy::ecu::forwarder::Forward;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct MockCollector {
    received: Mutex<Vec<(u16, Vec<u8>)>>,
    fail: bool,
}

#[async_trait]
impl Forward for MockCollector {
    async fn forward(&self, port: u16, payload: &[u8]) -> Result<Bytes, ForwardingError> {
        if let Ok(mut received) = self.received.lock() {
            received.push((port, payload.to_vec()));
        }

        if self.fail {
            Err(ForwardingError::Timeout(std::time::Duration::from_secs(1)))
        } else {
            Ok(Bytes::from_static(b"ACK"))
        }
    }
}

impl MockCollector {
    fn payloads(&self) -> Vec<(u16, Vec<u8>)> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

// serves a single connection with `handler` and hands back the client end
async fn connect(handler: ConnectionHandler) -> Result<(TcpStream, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let _ = handler.run(stream, port).await;
        }
    });

    Ok((TcpStream::connect(("127.0.0.1", port)).await?, port))
}

async fn read_response(client: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = [0u8; 64];
    let len = tokio::time::timeout(std::time::Duration::from_secs(5), client.read(&mut buf)).await??;
    Ok(buf[..len].to_vec())
}

#[tokio::test]
async fn relays_frame_and_returns_collector_answer() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let collector = Arc::new(MockCollector::default());
    let mut from_ecu = channels.from_ecu.subscribe();

    let (mut client, port) = connect(handler(Some(collector.clone() as Arc<dyn Forward>), &channels, &stats)).await?;

    let frame = Factory::frame()
        .inverter(Factory::inverter("406000000001"))
        .build();
    client.write_all(&frame).await?;

    assert_eq!(read_response(&mut client).await?, b"ACK".to_vec());
    assert_eq!(collector.payloads(), vec![(port, frame)]);

    let reading = next_reading(&mut from_ecu).await?;
    assert_eq!(reading.ecu_id, "216000012345");
    assert_eq!(reading.inverter_uids(), vec!["406000000001"]);

    let stats = stats.lock().map(|s| s.clone()).map_err(|_| anyhow!("poisoned"))?;
    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.frames_forwarded, 1);
    assert_eq!(stats.readings_decoded, 1);

    Ok(())
}

#[tokio::test]
async fn forwarding_disabled_still_emits_readings() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let mut from_ecu = channels.from_ecu.subscribe();

    let handler = handler(None, &channels, &stats);
    assert!(!handler.forwarding_enabled());

    let (mut client, _) = connect(handler).await?;
    client.write_all(&Factory::frame().build()).await?;

    let reading = next_reading(&mut from_ecu).await?;
    assert_eq!(reading.ecu_model, "ECU-R");

    let forwarded = stats.lock().map(|s| s.frames_forwarded).unwrap_or(u64::MAX);
    assert_eq!(forwarded, 0);

    // no collector answer to relay, so the ECU gets nothing back
    let mut buf = [0u8; 16];
    let silent = tokio::time::timeout(std::time::Duration::from_millis(200), client.read(&mut buf)).await;
    assert!(silent.is_err());

    Ok(())
}

// the collector lives on 127.0.0.2 with the same port the proxy listens on
async fn collector_on_listener_port() -> Result<(TcpListener, u16)> {
    let collector = TcpListener::bind("127.0.0.2:0").await?;
    let port = collector.local_addr()?.port();
    Ok((collector, port))
}

async fn assert_not_contacted(collector: TcpListener, yaml: &str, no_forward: bool, port: u16) -> Result<()> {
    let config = ConfigWrapper::from_config(Config::parse(yaml)?);
    let components = ecu_proxy::Components::start(config, no_forward).await?;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await?;
    client.write_all(&Factory::frame().build()).await?;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while components.stats.lock().map(|s| s.readings_decoded).unwrap_or_default() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "frame never decoded");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let accepted = tokio::time::timeout(std::time::Duration::from_millis(300), collector.accept()).await;
    assert!(accepted.is_err(), "collector was contacted");

    let forwarded = components.stats.lock().map(|s| s.frames_forwarded).unwrap_or(u64::MAX);
    assert_eq!(forwarded, 0);

    components.stop().await;
    Ok(())
}

#[tokio::test]
async fn upstream_disabled_in_config_opens_no_collector_connection() -> Result<()> {
    common_setup();

    let (collector, port) = collector_on_listener_port().await?;
    let yaml = format!(
        "listener: {{ host: 127.0.0.1, ports: [{}] }}\nupstream: {{ enabled: false, host: 127.0.0.2 }}",
        port
    );

    assert_not_contacted(collector, &yaml, false, port).await
}

#[tokio::test]
async fn no_forward_flag_opens_no_collector_connection() -> Result<()> {
    common_setup();

    let (collector, port) = collector_on_listener_port().await?;
    let yaml = format!(
        "listener: {{ host: 127.0.0.1, ports: [{}] }}\nupstream: {{ enabled: true, host: 127.0.0.2 }}",
        port
    );

    assert_not_contacted(collector, &yaml, true, port).await
}

#[tokio::test]
async fn non_telemetry_frames_are_still_relayed() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let collector = Arc::new(MockCollector::default());
    let mut from_ecu = channels.from_ecu.subscribe();

    let (mut client, _) = connect(handler(Some(collector.clone() as Arc<dyn Forward>), &channels, &stats)).await?;

    client.write_all(b"APS1100280002END\n").await?;
    assert_eq!(read_response(&mut client).await?, b"ACK".to_vec());

    // a rejected frame does not end the connection
    client.write_all(&Factory::frame().build()).await?;
    assert_eq!(read_response(&mut client).await?, b"ACK".to_vec());

    next_reading(&mut from_ecu).await?;
    assert_eq!(collector.payloads().len(), 2);

    let not_recognized = stats.lock().map(|s| s.not_recognized).unwrap_or_default();
    assert_eq!(not_recognized, 1);

    Ok(())
}

#[tokio::test]
async fn forward_failure_does_not_block_decoding() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let collector = Arc::new(MockCollector {
        fail: true,
        ..Default::default()
    });
    let mut from_ecu = channels.from_ecu.subscribe();

    let (mut client, _) = connect(handler(Some(collector as Arc<dyn Forward>), &channels, &stats)).await?;
    client.write_all(&Factory::frame().build()).await?;

    next_reading(&mut from_ecu).await?;

    let forward_errors = stats.lock().map(|s| s.forward_errors).unwrap_or_default();
    assert_eq!(forward_errors, 1);

    Ok(())
}

#[tokio::test]
async fn peer_close_ends_the_connection_cleanly() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let handler = handler(None, &channels, &stats);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let client = TcpStream::connect(("127.0.0.1", port)).await?;
    let (stream, _) = listener.accept().await?;

    drop(client);

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handler.run(stream, port)).await?;
    assert!(result.is_ok());

    Ok(())
}

#[tokio::test]
async fn idle_connection_times_out() -> Result<()> {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let handler = handler(None, &channels, &stats)
        .with_read_timeout(Some(std::time::Duration::from_millis(50)));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let _client = TcpStream::connect(("127.0.0.1", port)).await?;
    let (stream, _) = listener.accept().await?;

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handler.run(stream, port)).await?;
    assert!(result.is_err());

    Ok(())
}

#[test]
fn handle_frame_reports_rejections() {
    common_setup();

    let channels = Channels::new();
    let stats = stats();
    let handler = handler(None, &channels, &stats);

    let frame = Factory::frame().checksum(1).build();
    assert!(matches!(
        handler.handle_frame(8995, &frame),
        Err(RejectReason::ChecksumMismatch { declared: 1, .. })
    ));

    let stale = Factory::frame()
        .timestamp(chrono::Local::now().naive_local() - chrono::Duration::seconds(3600))
        .build();
    assert!(matches!(
        handler.handle_frame(8995, &stale),
        Err(RejectReason::Stale { .. })
    ));

    let counts = stats
        .lock()
        .map(|s| (s.checksum_errors, s.stale_frames))
        .unwrap_or_default();
    assert_eq!(counts, (1, 1));
}
