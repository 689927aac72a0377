/*!
 * TCP Streaming Server
 *
 * Every accepted connection gets its own pipeline; the connection receives
 * the raw packet stream (header packets, then one body packet per NAL unit)
 * and nothing else. The pipeline is torn down when the peer disconnects, a
 * write fails, or the server is cancelled. On cancellation every packet
 * captured so far is flushed before the socket closes.
 */

use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{PipelineOptions, ServerConfig};
use crate::packet::PacketSink;
use crate::pipeline::{Backends, Pipeline};
use crate::stats::StatsSnapshot;

/// Builds the platform services for one connection's pipeline
pub type BackendsFactory = Arc<dyn Fn() -> Backends + Send + Sync>;

pub struct StreamServer {
    config: ServerConfig,
    backends: BackendsFactory,
}

impl StreamServer {
    /// Server using this platform's display and hardware encoder
    pub fn new(config: ServerConfig) -> Self {
        Self::with_backends(config, Arc::new(Backends::platform))
    }

    pub fn with_backends(config: ServerConfig, backends: BackendsFactory) -> Self {
        Self { config, backends }
    }

    /// Bind the configured address and serve until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen))?;
        self.serve(listener, cancel).await
    }

    /// Accept connections on `listener` until `cancel` fires, then wait for
    /// every connection to flush and close
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!("Streaming on {}", listener.local_addr()?);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = Uuid::new_v4();
                        let span = info_span!("connection", %id, %peer);
                        connections.spawn(
                            stream_connection(
                                stream,
                                peer,
                                self.config.pipeline.clone(),
                                self.backends.clone(),
                                cancel.clone(),
                            )
                            .instrument(span),
                        );
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down; waiting for {} connection(s)", connections.len());
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                error!("Connection task failed: {}", e);
            }
        }
        Ok(())
    }
}

/// Why a connection's writer loop ended
enum Ending {
    PeerClosed,
    WriteFailed,
    Cancelled,
}

async fn stream_connection(
    stream: TcpStream,
    peer: SocketAddr,
    options: PipelineOptions,
    backends: BackendsFactory,
    cancel: CancellationToken,
) {
    info!("Client connected: {}", peer);
    match run_connection(stream, options, backends, cancel).await {
        Ok(stats) => info!(
            "Client {} finished: {}",
            peer,
            serde_json::to_string(&stats).unwrap_or_default()
        ),
        Err(e) => error!("Client {} failed: {:#}", peer, e),
    }
}

async fn run_connection(
    stream: TcpStream,
    options: PipelineOptions,
    backends: BackendsFactory,
    cancel: CancellationToken,
) -> Result<StatsSnapshot> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {}", e);
    }
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let sink: Arc<dyn PacketSink> = Arc::new(move |packet: &[u8]| {
        // Receiver gone means the connection is closing; the packet is moot.
        let _ = tx.send(Bytes::copy_from_slice(packet));
    });

    // Creation and teardown block on capture and encoder threads.
    let pipeline = tokio::task::spawn_blocking(move || {
        let backends = backends();
        let mut pipeline = Pipeline::create(sink, options, &backends)?;
        pipeline.start()?;
        anyhow::Ok(pipeline)
    })
    .await
    .context("Pipeline setup task failed")??;

    let mut scratch = [0u8; 256];
    let ending = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ending::Cancelled,
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break Ending::PeerClosed,
                // Inbound bytes carry no meaning on this stream.
                Ok(_) => continue,
            },
            packet = rx.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = writer.write_all(&packet).await {
                        warn!("Write failed: {}", e);
                        break Ending::WriteFailed;
                    }
                }
                None => break Ending::PeerClosed,
            },
        }
    };

    let stats = tokio::task::spawn_blocking(move || pipeline.destroy())
        .await
        .context("Pipeline teardown task failed")?;

    if let Ending::Cancelled = ending {
        while let Ok(packet) = rx.try_recv() {
            writer
                .write_all(&packet)
                .await
                .context("Failed to flush packets on shutdown")?;
        }
        writer.shutdown().await.ok();
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FramedPacket, LengthOrder};
    use crate::testing::{FakeEncoder, FakeSample, ManualScreen};
    use crate::video::ParameterSets;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn server(screen: ManualScreen, encoder: FakeEncoder) -> StreamServer {
        let config = ServerConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            pipeline: PipelineOptions::default(),
        };
        StreamServer::with_backends(
            config,
            Arc::new(move || Backends::new(Box::new(screen.clone()), Box::new(encoder.clone()))),
        )
    }

    async fn spawn(server: StreamServer) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { server.serve(listener, token).await });
        (addr, cancel, task)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn body(sequence: u64, sync: bool) -> Vec<u8> {
        let mut nal = vec![if sync { 0x65 } else { 0x41 }];
        nal.extend_from_slice(&sequence.to_be_bytes());
        FramedPacket::body(&nal, LengthOrder::Little).unwrap().bytes.to_vec()
    }

    #[tokio::test]
    async fn test_connection_receives_packet_stream() {
        let screen = ManualScreen::new();
        let (addr, cancel, task) = spawn(server(screen.clone(), FakeEncoder::new().keyframe_every(1000))).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for(|| screen.start_count() == 1).await;

        for sequence in 0..3 {
            assert!(screen.inject(sequence));
        }
        cancel.cancel();

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        task.await.unwrap().unwrap();

        let sample = FakeSample::keyframe(Vec::new());
        let sets = ParameterSets {
            vps: None,
            sps: sample.sps,
            pps: sample.pps,
        };
        let mut expected = FramedPacket::header(&sets, LengthOrder::Little).unwrap().bytes.to_vec();
        expected.extend(body(0, true));
        expected.extend(body(1, false));
        expected.extend(body(2, false));

        assert_eq!(received, expected);
        assert_eq!(screen.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_pipeline() {
        let screen = ManualScreen::new();
        let encoder = FakeEncoder::new();
        let (addr, cancel, task) = spawn(server(screen.clone(), encoder.clone())).await;

        let client = TcpStream::connect(addr).await.unwrap();
        wait_for(|| screen.start_count() == 1).await;
        drop(client);

        wait_for(|| encoder.state().invalidated).await;
        assert_eq!(screen.stop_count(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_failure_closes_connection() {
        let screen = ManualScreen::unavailable();
        let (addr, cancel, task) = spawn(server(screen, FakeEncoder::new())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut received = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_with_no_clients() {
        let (_addr, cancel, task) = spawn(server(ManualScreen::new(), FakeEncoder::new())).await;
        cancel.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    }
}
