//! Transfer engine
//!
//! Sender side streams a requested file as fixed-size binary frames
//! followed by a terminal `TRANSFER_COMPLETE`. Receiver side appends
//! chunks in arrival order to a fresh `.part` file and finalizes it on
//! completion. The channel is ordered and reliable, so no chunk indexing
//! or reassembly is needed. Each transfer owns its channel; a failure
//! aborts that transfer only.

use super::TransferError;
use crate::crypto::Fingerprint;
use crate::p2p::channel::{decode_control, ControlMessage, FrameSink, FrameSource};
use crate::p2p::wire::Frame;
use crate::storage::SharedCatalog;

use libp2p::PeerId;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// State of one in-flight transfer. Never shared across channels.
#[derive(Debug)]
pub struct ActiveTransfer {
    pub fingerprint: Fingerprint,
    pub direction: Direction,
    pub bytes: u64,
    pub started_at: Instant,
}

impl ActiveTransfer {
    fn new(fingerprint: Fingerprint, direction: Direction) -> Self {
        Self {
            fingerprint,
            direction,
            bytes: 0,
            started_at: Instant::now(),
        }
    }
}

/// Outcome of a finished transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub fingerprint: Fingerprint,
    pub bytes: u64,
    pub elapsed: Duration,
    pub path: PathBuf,
}

/// Sender/receiver logic for the chunked transfer protocol.
pub struct TransferEngine {
    catalog: Arc<dyn SharedCatalog>,
    download_dir: PathBuf,
    chunk_size: usize,
    idle_timeout: Duration,
}

impl TransferEngine {
    pub fn new(
        catalog: Arc<dyn SharedCatalog>,
        download_dir: PathBuf,
        chunk_size: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            download_dir,
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            idle_timeout,
        }
    }

    /// Request `fingerprint` over the channel and write the incoming bytes
    /// to the download directory. The partial file is removed on any
    /// failure.
    pub async fn download<C>(
        &self,
        channel: &mut C,
        fingerprint: &Fingerprint,
    ) -> Result<TransferReport, TransferError>
    where
        C: FrameSource + FrameSink,
    {
        tokio::fs::create_dir_all(&self.download_dir).await?;

        channel
            .send_control(&ControlMessage::RequestFile {
                fingerprint: *fingerprint,
            })
            .await?;

        let part_path = self.download_dir.join(format!("{fingerprint}.part"));
        let mut output = tokio::fs::File::create(&part_path).await?;
        let mut transfer = ActiveTransfer::new(*fingerprint, Direction::Receive);

        tracing::debug!(%fingerprint, path = %part_path.display(), "receiving file");

        match self.receive_loop(channel, &mut output, &mut transfer).await {
            Ok(()) => {
                output.flush().await?;
                drop(output);

                let final_path = self.download_dir.join(fingerprint.to_hex());
                tokio::fs::rename(&part_path, &final_path).await?;

                let report = TransferReport {
                    fingerprint: *fingerprint,
                    bytes: transfer.bytes,
                    elapsed: transfer.started_at.elapsed(),
                    path: final_path,
                };
                tracing::info!(
                    %fingerprint,
                    size = %format_bytes(report.bytes),
                    elapsed = ?report.elapsed,
                    "download complete"
                );
                Ok(report)
            }
            Err(e) => {
                drop(output);
                let _ = tokio::fs::remove_file(&part_path).await;
                Err(e)
            }
        }
    }

    async fn receive_loop<C>(
        &self,
        channel: &mut C,
        output: &mut tokio::fs::File,
        transfer: &mut ActiveTransfer,
    ) -> Result<(), TransferError>
    where
        C: FrameSource + FrameSink,
    {
        loop {
            let frame = match timeout(self.idle_timeout, channel.next_frame()).await {
                Err(_) => return Err(TransferError::IdleTimeout(self.idle_timeout)),
                Ok(frame) => frame?,
            };

            match frame {
                Some(Frame::Binary(chunk)) => {
                    output.write_all(&chunk).await?;
                    transfer.bytes += chunk.len() as u64;
                }
                Some(Frame::Control(body)) => match decode_control(&body)? {
                    ControlMessage::TransferComplete => return Ok(()),
                    ControlMessage::Error { message } => {
                        return Err(TransferError::Remote(message))
                    }
                    other => {
                        return Err(TransferError::Protocol(format!(
                            "unexpected control message {other:?} during transfer"
                        )))
                    }
                },
                None => return Err(TransferError::ChannelClosed),
            }
        }
    }

    /// Serve file requests arriving on an inbound channel until it closes.
    /// A failed transfer aborts this channel only.
    pub async fn serve<C>(&self, channel: &mut C, peer: PeerId)
    where
        C: FrameSource + FrameSink,
    {
        loop {
            match channel.next_frame().await {
                Ok(Some(Frame::Control(body))) => match decode_control(&body) {
                    Ok(ControlMessage::RequestFile { fingerprint }) => {
                        match self.send_shared(channel, &fingerprint).await {
                            Ok(Some(report)) => {
                                tracing::info!(
                                    %peer,
                                    %fingerprint,
                                    size = %format_bytes(report.bytes),
                                    "file sent"
                                );
                            }
                            // Unknown file: the error control message has
                            // already gone to the remote.
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!(%peer, %fingerprint, error = %e, "transfer aborted");
                                return;
                            }
                        }
                    }
                    Ok(ControlMessage::Error { message }) => {
                        tracing::warn!(%peer, %message, "remote reported an error");
                    }
                    Ok(other) => {
                        tracing::debug!(%peer, ?other, "ignoring control message");
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "malformed control frame, closing channel");
                        return;
                    }
                },
                Ok(Some(Frame::Binary(_))) => {
                    tracing::warn!(%peer, "unexpected binary frame on serving channel");
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "channel read failed");
                    return;
                }
            }
        }
    }

    /// Stream a shared file. Returns `Ok(None)` if the fingerprint is not
    /// in the catalog (the remote gets an error control message and no
    /// data).
    async fn send_shared<C>(
        &self,
        channel: &mut C,
        fingerprint: &Fingerprint,
    ) -> Result<Option<TransferReport>, TransferError>
    where
        C: FrameSink,
    {
        let Some(shared) = self.catalog.lookup(fingerprint) else {
            tracing::warn!(%fingerprint, "request for a file we do not share");
            channel
                .send_control(&ControlMessage::Error {
                    message: format!("unknown file {fingerprint}"),
                })
                .await?;
            return Ok(None);
        };

        let mut file = match tokio::fs::File::open(&shared.path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(%fingerprint, path = %shared.path.display(), error = %e, "shared file unreadable");
                channel
                    .send_control(&ControlMessage::Error {
                        message: format!("could not open {fingerprint}"),
                    })
                    .await?;
                return Ok(None);
            }
        };

        let mut transfer = ActiveTransfer::new(*fingerprint, Direction::Send);
        let mut buffer = vec![0u8; self.chunk_size];

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            channel.send_chunk(&buffer[..n]).await?;
            transfer.bytes += n as u64;
        }

        channel.send_control(&ControlMessage::TransferComplete).await?;

        Ok(Some(TransferReport {
            fingerprint: *fingerprint,
            bytes: transfer.bytes,
            elapsed: transfer.started_at.elapsed(),
            path: shared.path,
        }))
    }
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, ["K", "M", "G", "T", "P", "E"][exp])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::wire::WireError;
    use crate::storage::{MemoryCatalog, SharedFile};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;

    /// In-memory channel double: frames pushed into `incoming` are read by
    /// the engine, frames the engine sends land in `sent`.
    struct TestChannel {
        incoming: VecDeque<Frame>,
        sent: Vec<Frame>,
    }

    impl TestChannel {
        fn new(incoming: Vec<Frame>) -> Self {
            Self {
                incoming: incoming.into(),
                sent: Vec::new(),
            }
        }

        fn control(msg: &ControlMessage) -> Frame {
            Frame::Control(serde_json::to_vec(msg).unwrap())
        }
    }

    #[async_trait]
    impl FrameSink for TestChannel {
        async fn send_control(&mut self, msg: &ControlMessage) -> Result<(), WireError> {
            self.sent.push(Self::control(msg));
            Ok(())
        }

        async fn send_chunk(&mut self, data: &[u8]) -> Result<(), WireError> {
            self.sent.push(Frame::Binary(data.to_vec()));
            Ok(())
        }
    }

    #[async_trait]
    impl FrameSource for TestChannel {
        async fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
            Ok(self.incoming.pop_front())
        }
    }

    fn patterned_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn engine_with(catalog: Arc<MemoryCatalog>, dir: &std::path::Path) -> TransferEngine {
        TransferEngine::new(
            catalog,
            dir.to_path_buf(),
            16 * 1024,
            Duration::from_secs(5),
        )
    }

    async fn share(catalog: &MemoryCatalog, dir: &std::path::Path, data: &[u8]) -> SharedFile {
        let path = dir.join("source.bin");
        tokio::fs::write(&path, data).await.unwrap();
        let shared = SharedFile {
            fingerprint: Fingerprint::hash(data),
            path,
            filename: "source.bin".to_string(),
            size: data.len() as u64,
            added_at: Utc::now(),
        };
        catalog.add(shared.clone()).unwrap();
        shared
    }

    #[tokio::test]
    async fn test_transfer_fidelity_end_to_end() {
        let provider_dir = tempfile::tempdir().unwrap();
        let requester_dir = tempfile::tempdir().unwrap();
        let data = patterned_bytes(300_000);

        // Provider: serve a single REQUEST_FILE, then the channel closes.
        let catalog = Arc::new(MemoryCatalog::new());
        let shared = share(&catalog, provider_dir.path(), &data).await;
        let provider = engine_with(catalog, provider_dir.path());

        let mut provider_channel = TestChannel::new(vec![TestChannel::control(
            &ControlMessage::RequestFile {
                fingerprint: shared.fingerprint,
            },
        )]);
        provider.serve(&mut provider_channel, PeerId::random()).await;

        // The sender must emit chunks in order with exactly one terminal
        // TRANSFER_COMPLETE after the last chunk.
        let completes: Vec<usize> = provider_channel
            .sent
            .iter()
            .enumerate()
            .filter_map(|(i, f)| match f {
                Frame::Control(body) => match decode_control(body).unwrap() {
                    ControlMessage::TransferComplete => Some(i),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(completes, vec![provider_channel.sent.len() - 1]);

        // Requester: feed the provider's frames in and download.
        let requester = engine_with(Arc::new(MemoryCatalog::new()), requester_dir.path());
        let mut requester_channel = TestChannel::new(provider_channel.sent);

        let report = requester
            .download(&mut requester_channel, &shared.fingerprint)
            .await
            .unwrap();

        assert_eq!(report.bytes, data.len() as u64);
        let received = tokio::fs::read(&report.path).await.unwrap();
        assert_eq!(received, data);
        assert_eq!(Fingerprint::hash(&received), shared.fingerprint);

        // The requester sent exactly the file request.
        assert_eq!(
            requester_channel.sent,
            vec![TestChannel::control(&ControlMessage::RequestFile {
                fingerprint: shared.fingerprint,
            })]
        );
    }

    #[tokio::test]
    async fn test_unknown_file_yields_error_and_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let provider = engine_with(Arc::new(MemoryCatalog::new()), dir.path());

        let unknown = Fingerprint::hash(b"nobody shares this");
        let mut channel = TestChannel::new(vec![TestChannel::control(
            &ControlMessage::RequestFile {
                fingerprint: unknown,
            },
        )]);
        provider.serve(&mut channel, PeerId::random()).await;

        assert_eq!(channel.sent.len(), 1);
        match &channel.sent[0] {
            Frame::Control(body) => {
                assert!(matches!(
                    decode_control(body).unwrap(),
                    ControlMessage::Error { .. }
                ));
            }
            Frame::Binary(_) => panic!("binary frame sent for an unknown file"),
        }
    }

    #[tokio::test]
    async fn test_remote_error_aborts_and_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let requester = engine_with(Arc::new(MemoryCatalog::new()), dir.path());
        let fingerprint = Fingerprint::hash(b"whatever");

        let mut channel = TestChannel::new(vec![
            Frame::Binary(vec![1, 2, 3]),
            TestChannel::control(&ControlMessage::Error {
                message: "disk on fire".to_string(),
            }),
        ]);

        let err = requester.download(&mut channel, &fingerprint).await.unwrap_err();
        assert!(matches!(err, TransferError::Remote(_)));

        let part = dir.path().join(format!("{fingerprint}.part"));
        assert!(!part.exists());
        assert!(!dir.path().join(fingerprint.to_hex()).exists());
    }

    #[tokio::test]
    async fn test_channel_close_mid_transfer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let requester = engine_with(Arc::new(MemoryCatalog::new()), dir.path());
        let fingerprint = Fingerprint::hash(b"half a file");

        // Chunks but no terminal message before EOF.
        let mut channel = TestChannel::new(vec![Frame::Binary(vec![0u8; 1024])]);

        let err = requester.download(&mut channel, &fingerprint).await.unwrap_err();
        assert!(matches!(err, TransferError::ChannelClosed));
        assert!(!dir.path().join(format!("{fingerprint}.part")).exists());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
