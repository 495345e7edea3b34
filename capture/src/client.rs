//! Listener side of the live capture protocol.

use std::time::Duration;

use profile_format::{CaptureDump, FileHeader};
use protocol::{read_message, write_message, Message, ProtocolError};
use tracing::{debug, warn};

use crate::transport::Transport;
use crate::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    CaptureRequested,
    ReceivingDescriptors,
    ReceivingBlocks,
}

/// Raw bytes collected from one capture session.
///
/// On connection loss mid-stream the bytes received so far are retained
/// and `complete` is false, so a partial capture can still be inspected.
#[derive(Debug, Default)]
pub struct CaptureStream {
    pub descriptors: Vec<u8>,
    pub blocks: Vec<u8>,
    pub complete: bool,
    pub process_id: u64,
}

impl CaptureStream {
    /// Assemble a dump from the collected tables. Incomplete streams are
    /// parsed best-effort; a truncated tail record is dropped.
    pub fn into_dump(self) -> profile_format::Result<CaptureDump> {
        let mut dump = CaptureDump::new(FileHeader {
            process_id: self.process_id,
            ..FileHeader::default()
        });
        if self.complete {
            dump.extend_descriptors(&self.descriptors)?;
            dump.extend_records(&self.blocks)?;
        } else {
            dump.extend_descriptors_lossy(&self.descriptors)?;
            dump.extend_records_lossy(&self.blocks)?;
        }
        let begin = dump.records.iter().map(|r| r.begin).min().unwrap_or(0);
        let end = dump.records.iter().map(|r| r.end).max().unwrap_or(0);
        dump.header.begin_time = begin;
        dump.header.end_time = end;
        Ok(dump)
    }
}

/// Drives a capture session against a remote [`ProfilerServer`].
///
/// [`ProfilerServer`]: crate::server::ProfilerServer
pub struct CaptureClient<T: Transport> {
    transport: Option<T>,
    state: ClientState,
    remote_process_id: u64,
}

impl<T: Transport> CaptureClient<T> {
    pub fn new() -> Self {
        CaptureClient {
            transport: None,
            state: ClientState::Idle,
            remote_process_id: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn remote_process_id(&self) -> u64 {
        self.remote_process_id
    }

    /// Attach a freshly connected transport and run the status handshake.
    pub fn connect(&mut self, mut transport: T) -> Result<()> {
        self.state = ClientState::Connecting;
        match read_message(&mut transport) {
            Ok(Message::Status {
                version,
                process_id,
                ..
            }) => {
                debug!(version, process_id, "connected to profiled process");
                self.remote_process_id = process_id;
                self.transport = Some(transport);
                self.state = ClientState::Connected;
                Ok(())
            }
            Ok(other) => {
                self.state = ClientState::Idle;
                Err(ProtocolError::UnexpectedMessage(other.kind()).into())
            }
            Err(e) => {
                self.state = ClientState::Idle;
                Err(e.into())
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.transport = None;
        self.state = ClientState::Idle;
    }

    fn transport(&mut self) -> Result<&mut T> {
        self.transport.as_mut().ok_or(CaptureError::NotConnected)
    }

    pub fn request_start(&mut self) -> Result<()> {
        if self.state != ClientState::Connected {
            return Err(CaptureError::NotConnected);
        }
        let transport = self.transport()?;
        write_message(transport, &Message::StartCapture)?;
        self.state = ClientState::CaptureRequested;
        Ok(())
    }

    /// Stop the running capture and collect both reply streams.
    ///
    /// Connection loss mid-stream is not an error here: whatever arrived
    /// is returned with `complete == false` and the client drops to Idle.
    pub fn request_stop_and_collect(&mut self) -> Result<CaptureStream> {
        if self.state != ClientState::CaptureRequested {
            return Err(CaptureError::NotConnected);
        }
        let mut transport = self.transport.take().ok_or(CaptureError::NotConnected)?;
        let mut stream = CaptureStream {
            process_id: self.remote_process_id,
            ..CaptureStream::default()
        };
        self.state = ClientState::Idle;

        if let Err(e) = write_message(&mut transport, &Message::StopCapture) {
            warn!(error = %e, "connection lost before stop request");
            return Ok(stream);
        }

        self.state = ClientState::ReceivingDescriptors;
        loop {
            match read_message(&mut transport) {
                Ok(Message::BlocksDescription(payload)) => {
                    stream.descriptors.extend_from_slice(&payload);
                }
                Ok(Message::BlocksDescriptionEnd) => {
                    self.state = ClientState::ReceivingBlocks;
                }
                Ok(Message::Blocks(payload)) => {
                    stream.blocks.extend_from_slice(&payload);
                }
                Ok(Message::BlocksEnd) => {
                    stream.complete = true;
                    self.state = ClientState::Connected;
                    self.transport = Some(transport);
                    return Ok(stream);
                }
                Ok(Message::Ping) => {
                    // Heartbeats may interleave with the reply streams.
                    let _ = write_message(&mut transport, &Message::Pong);
                }
                Ok(other) => {
                    warn!(kind = ?other.kind(), "unexpected message during flush");
                    self.state = ClientState::Idle;
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(error = %e, "connection lost during flush, keeping partial capture");
                    self.state = ClientState::Idle;
                    return Ok(stream);
                }
            }
        }
    }

    /// Toggle one descriptor's enabled flag on the profiled process.
    pub fn edit_block_status(&mut self, descriptor_id: u32, enabled: bool) -> Result<()> {
        let transport = self.transport()?;
        write_message(
            transport,
            &Message::EditBlockStatus {
                descriptor_id,
                enabled,
            },
        )?;
        Ok(())
    }

    pub fn set_event_tracing(&mut self, enabled: bool) -> Result<()> {
        let transport = self.transport()?;
        write_message(transport, &Message::EventTracingStatus { enabled })?;
        Ok(())
    }

    pub fn set_event_tracing_priority(&mut self, low: bool) -> Result<()> {
        let transport = self.transport()?;
        write_message(transport, &Message::EventTracingPriority { low })?;
        Ok(())
    }

    /// Heartbeat: send a ping and wait up to `timeout` for the ack.
    pub fn check_connection(&mut self, timeout: Duration) -> Result<bool> {
        let mut transport = self.transport.take().ok_or(CaptureError::NotConnected)?;
        let result = Self::ping(&mut transport, timeout);
        let restore = transport.set_read_timeout(None);
        match result {
            Ok(alive) => {
                // A transport that cannot leave timeout mode is unusable.
                if let Err(e) = restore {
                    self.state = ClientState::Idle;
                    return Err(e.into());
                }
                self.transport = Some(transport);
                Ok(alive)
            }
            Err(e) => {
                self.state = ClientState::Idle;
                Err(e)
            }
        }
    }

    fn ping(transport: &mut T, timeout: Duration) -> Result<bool> {
        write_message(transport, &Message::Ping)?;
        transport.set_read_timeout(Some(timeout))?;
        loop {
            match read_message(transport) {
                Ok(Message::Pong) => return Ok(true),
                Ok(other) => {
                    debug!(kind = ?other.kind(), "ignoring message while waiting for pong");
                }
                Err(ProtocolError::Io(e))
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<T: Transport> Default for CaptureClient<T> {
    fn default() -> Self {
        CaptureClient::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CaptureController;
    use crate::server::ProfilerServer;
    use crate::transport::{pair_transport, PairTransport};
    use profile_format::BlockKind;
    use rstest::rstest;
    use std::thread;

    fn connected_client() -> (
        CaptureClient<PairTransport>,
        std::sync::Arc<CaptureController>,
        thread::JoinHandle<crate::Result<()>>,
    ) {
        let controller = CaptureController::new();
        let server = ProfilerServer::new(controller.clone());
        let (local, mut remote) = pair_transport();
        let handle = thread::spawn(move || server.serve_connection(&mut remote));

        let mut client = CaptureClient::new();
        client.connect(local).unwrap();
        (client, controller, handle)
    }

    #[rstest]
    fn test_connect_handshake() {
        let (client, controller, handle) = connected_client();
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.remote_process_id(), controller.process_id());
        drop(client);
        handle.join().unwrap().unwrap();
    }

    #[rstest]
    fn test_full_capture_session() {
        let (mut client, controller, handle) = connected_client();
        let work = controller.register_block("work", "app.rs", 5, 0xFF112233, BlockKind::Block);

        client.request_start().unwrap();
        while !controller.is_capturing() {
            thread::yield_now();
        }
        controller.store_block(3, work, 0, 100, None).unwrap();
        controller.store_block(3, work, 10, 50, None).unwrap();

        let stream = client.request_stop_and_collect().unwrap();
        assert!(stream.complete);
        assert_eq!(client.state(), ClientState::Connected);

        let dump = stream.into_dump().unwrap();
        assert_eq!(dump.descriptors.len(), 1);
        assert_eq!(dump.records.len(), 2);
        assert_eq!(dump.header.begin_time, 0);
        assert_eq!(dump.header.end_time, 100);

        drop(client);
        handle.join().unwrap().unwrap();
    }

    #[rstest]
    fn test_heartbeat() {
        let (mut client, _controller, handle) = connected_client();
        assert!(client
            .check_connection(Duration::from_millis(200))
            .unwrap());
        drop(client);
        handle.join().unwrap().unwrap();
    }

    /// Transport whose read timeout can be set but never cleared again.
    struct StuckTimeoutTransport {
        inner: PairTransport,
    }

    impl std::io::Read for StuckTimeoutTransport {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl std::io::Write for StuckTimeoutTransport {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.inner.flush()
        }
    }

    impl crate::transport::Transport for StuckTimeoutTransport {
        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
            match timeout {
                Some(t) => self.inner.set_read_timeout(Some(t)),
                None => Err(std::io::Error::other("timeout stuck")),
            }
        }
    }

    #[rstest]
    fn test_failed_timeout_restore_disconnects() {
        let (local, mut remote) = pair_transport();
        let handle = thread::spawn(move || {
            protocol::write_message(
                &mut remote,
                &Message::Status {
                    version: protocol::VERSION,
                    process_id: 1,
                    profiling_enabled: false,
                    event_tracing_enabled: false,
                },
            )
            .unwrap();
            assert!(matches!(
                protocol::read_message(&mut remote).unwrap(),
                Message::Ping
            ));
            protocol::write_message(&mut remote, &Message::Pong).unwrap();
        });

        let mut client = CaptureClient::new();
        client
            .connect(StuckTimeoutTransport { inner: local })
            .unwrap();

        // The ping itself succeeds; restoring blocking mode does not.
        assert!(client.check_connection(Duration::from_millis(200)).is_err());
        assert_eq!(client.state(), ClientState::Idle);
        assert!(matches!(
            client.request_start(),
            Err(CaptureError::NotConnected)
        ));
        handle.join().unwrap();
    }

    #[rstest]
    fn test_edit_block_status_applies_remotely() {
        let (mut client, controller, handle) = connected_client();
        let id = controller.register_block("noisy", "app.rs", 8, 0, BlockKind::Block);

        client.edit_block_status(id, false).unwrap();
        // The toggle is applied by the server thread; ping round trip
        // guarantees it has been processed.
        assert!(client.check_connection(Duration::from_millis(200)).unwrap());

        controller.start_capture();
        controller.store_block(1, id, 0, 5, None).unwrap();
        assert!(controller.snapshot().unwrap().thread_chunks.is_empty());

        drop(client);
        handle.join().unwrap().unwrap();
    }

    #[rstest]
    fn test_disconnect_mid_flush_keeps_partial_stream() {
        // Hand-rolled server half that sends part of the reply and dies.
        let (local, mut remote) = pair_transport();
        let handle = thread::spawn(move || {
            protocol::write_message(
                &mut remote,
                &Message::Status {
                    version: protocol::VERSION,
                    process_id: 1,
                    profiling_enabled: false,
                    event_tracing_enabled: false,
                },
            )
            .unwrap();
            // start + stop requests
            assert!(matches!(
                protocol::read_message(&mut remote).unwrap(),
                Message::StartCapture
            ));
            assert!(matches!(
                protocol::read_message(&mut remote).unwrap(),
                Message::StopCapture
            ));
            protocol::write_message(&mut remote, &Message::BlocksDescription(vec![0u8; 8]))
                .unwrap();
            // Connection drops before the end markers.
        });

        let mut client = CaptureClient::new();
        client.connect(local).unwrap();
        client.request_start().unwrap();
        let stream = client.request_stop_and_collect().unwrap();

        assert!(!stream.complete);
        assert_eq!(stream.descriptors.len(), 8);
        assert_eq!(client.state(), ClientState::Idle);
        handle.join().unwrap();
    }

    #[rstest]
    fn test_request_start_requires_connection() {
        let mut client: CaptureClient<PairTransport> = CaptureClient::new();
        assert!(matches!(
            client.request_start(),
            Err(CaptureError::NotConnected)
        ));
    }
}
