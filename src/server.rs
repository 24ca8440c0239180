//! TCP server for handling channels.
//!
//! Accepts connections, runs the lifecycle hooks, decodes framed text
//! messages and dispatches each one through the router.
//!
//! Failure policy per channel:
//! - router or handler error: logged, message skipped, channel stays open
//! - codec error or I/O error: channel closed, error passed to the close hook
//! - EOF between frames: clean close
//! - EOF with a partial frame buffered: closed with `UnexpectedEof`

use crate::channel::{Channel, ChannelContext, ChannelRegistry, IdGenerator};
use crate::codec::{DecodeResult, PayloadCodec, TextCodec, VariableLengthCodec};
use crate::config::Config;
use crate::error::{ChannelError, ServerError};
use crate::hooks::{Hooks, LoggingHooks};
use crate::router::{EchoRouter, Router};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Frames a channel may have queued for the peer before `write` fails
const OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Configures hooks and router before binding.
pub struct ServerBuilder {
    config: Config,
    hooks: Arc<dyn Hooks>,
    router: Arc<dyn Router>,
}

impl ServerBuilder {
    pub fn hooks(mut self, hooks: impl Hooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn router(mut self, router: impl Router) -> Self {
        self.router = Arc::new(router);
        self
    }

    pub fn build(self) -> Server {
        Server {
            shared: Arc::new(Shared {
                hooks: self.hooks,
                router: self.router,
                codec: VariableLengthCodec::with_max_frame_size(self.config.max_frame_size),
                ids: IdGenerator::new(),
                registry: Mutex::new(ChannelRegistry::new(self.config.max_connections)),
            }),
            config: self.config,
        }
    }
}

/// Server instance
pub struct Server {
    config: Config,
    shared: Arc<Shared>,
}

/// State shared by the accept loop and every connection task.
struct Shared {
    hooks: Arc<dyn Hooks>,
    router: Arc<dyn Router>,
    codec: VariableLengthCodec,
    ids: IdGenerator,
    registry: Mutex<ChannelRegistry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, ChannelRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Server {
    /// Start building a server. Defaults to `LoggingHooks` and `EchoRouter`.
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            hooks: Arc::new(LoggingHooks),
            router: Arc::new(EchoRouter::default()),
        }
    }

    /// Bind the listening socket and start accepting channels.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(self) -> Result<RunningServer, ServerError> {
        let listen = self.config.listen.clone();
        let bind_err = |e: io::Error| ServerError::Bind(listen.clone(), e);

        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| bind_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let listener = create_listener(addr).map_err(bind_err)?;
        let listener = TcpListener::from_std(listener).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(
            address = %local_addr,
            max_frame_size = self.shared.codec.max_frame_size(),
            "Server listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            shutdown_rx,
        ));

        Ok(RunningServer {
            local_addr,
            shutdown: shutdown_tx,
            accept_task,
            shared: self.shared,
        })
    }
}

/// Handle to a bound server.
///
/// Dropping the handle without calling `shutdown` also stops the server,
/// but does not wait for channels to close.
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of channels currently open.
    pub fn active_channels(&self) -> usize {
        self.shared.registry().len()
    }

    /// Stop accepting, close every open channel and wait for their close
    /// hooks to finish.
    pub async fn shutdown(self) {
        info!(active = self.active_channels(), "Shutting down server");
        debug!(channels = ?self.shared.registry().ids(), "Closing channels");

        let _ = self.shutdown.send(true);
        if let Err(e) = self.accept_task.await {
            error!(error = %e, "Accept loop failed");
        }

        info!("Server stopped");
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind quickly.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut channels = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    match open_channel(&shared, stream, addr) {
                        Ok(conn) => {
                            channels.spawn(conn.run(shutdown.clone()));
                        }
                        Err(e) => warn!(peer = %addr, error = %e, "Dropping connection"),
                    }
                }
                Err(e) => {
                    error!(error = %ServerError::Accept(e), "Failed to accept connection");
                }
            },

            // Reap finished channel tasks
            Some(_) = channels.join_next(), if !channels.is_empty() => {}
        }
    }

    drop(listener);

    debug!(remaining = channels.len(), "Waiting for channels to close");
    while let Some(result) = channels.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Channel task failed");
        }
    }
}

/// Assign an id, register the channel and run the connect hook.
fn open_channel(
    shared: &Arc<Shared>,
    stream: TcpStream,
    remote_addr: SocketAddr,
) -> Result<Connection, ServerError> {
    let local_addr = stream.local_addr().map_err(ServerError::Accept)?;
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);

    let (ctx, key) = {
        let mut registry = shared.registry();
        if registry.is_full() {
            return Err(ServerError::RegistryFull {
                capacity: registry.capacity(),
            });
        }

        // Allocate under the lock so ids follow registration order
        let ctx = Arc::new(ChannelContext {
            id: shared.ids.next(),
            channel: Channel::new(remote_addr, local_addr, shared.codec, outbound_tx),
        });
        let key = registry
            .insert(Arc::clone(&ctx))
            .ok_or(ServerError::RegistryFull {
                capacity: registry.capacity(),
            })?;
        (ctx, key)
    };

    if let Err(e) = shared.hooks.on_channel(&ctx) {
        shared.registry().remove(key);
        return Err(ServerError::Rejected(e));
    }

    Ok(Connection {
        stream,
        ctx,
        key,
        outbound: outbound_rx,
        shared: Arc::clone(shared),
    })
}

/// A registered channel and its socket.
struct Connection {
    stream: TcpStream,
    ctx: Arc<ChannelContext>,
    key: usize,
    outbound: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl Connection {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let result = self.serve(&mut shutdown).await;

        self.shared.registry().remove(self.key);
        self.outbound.close();
        self.shared
            .hooks
            .on_channel_closed(&self.ctx, result.as_ref().err());
    }

    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ChannelError> {
        let result = self.read_loop(shutdown).await;

        // Replies queued before the channel stopped still go out; the first
        // error wins
        let flushed = self.flush_outbound().await;
        result.and(flushed)
    }

    async fn read_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ChannelError> {
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

        loop {
            self.dispatch_frames(&mut buffer)?;

            tokio::select! {
                _ = shutdown.changed() => {
                    trace!(id = %self.ctx.id, "Closing channel for shutdown");
                    return Ok(());
                }

                Some(frame) = self.outbound.recv() => {
                    self.stream.write_all(&frame).await?;
                }

                read = self.stream.read_buf(&mut buffer) => {
                    if read? == 0 {
                        trace!(id = %self.ctx.id, "Connection closed by peer");
                        return if buffer.is_empty() {
                            Ok(())
                        } else {
                            Err(ChannelError::Io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed with a partial frame buffered",
                            )))
                        };
                    }
                }
            }
        }
    }

    /// Decode and dispatch every complete frame in `buffer`.
    fn dispatch_frames(&self, buffer: &mut BytesMut) -> Result<(), ChannelError> {
        loop {
            match self.shared.codec.decode(buffer) {
                DecodeResult::Complete {
                    header_len,
                    payload_len,
                } => {
                    let frame = buffer.split_to(header_len + payload_len);
                    let msg = TextCodec.decode(&frame[header_len..])?;
                    self.dispatch(&msg);
                }
                DecodeResult::Incomplete => return Ok(()),
                DecodeResult::Invalid(e) => {
                    warn!(id = %self.ctx.id, error = %e, "Invalid frame");
                    return Err(e.into());
                }
            }
        }
    }

    fn dispatch(&self, msg: &str) {
        let ctx = &self.ctx;

        let handler = match self.shared.router.route(ctx, msg) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(id = %ctx.id, error = %e, "Failed to route message");
                return;
            }
        };

        trace!(id = %ctx.id, handler = handler.name(), "Dispatching message");
        if let Err(e) = handler.handle(ctx, msg) {
            warn!(
                id = %ctx.id,
                handler = handler.name(),
                error = %e,
                "Handler failed"
            );
        }
    }

    /// Write frames queued by handlers that have not been sent yet.
    async fn flush_outbound(&mut self) -> Result<(), ChannelError> {
        while let Ok(frame) = self.outbound.try_recv() {
            self.stream.write_all(&frame).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{self, FrameWriter};
    use crate::config::ClientConfig;
    use crate::error::{HandlerError, HookError, RouteError};
    use crate::hooks::LogBuffer;
    use crate::router::Handler;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Open(u32),
        Message(u32, String),
        Closed(u32, Option<String>),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
        reject: bool,
    }

    impl Recorder {
        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn closed(&self) -> Vec<Event> {
            self.events()
                .into_iter()
                .filter(|e| matches!(e, Event::Closed(..)))
                .collect()
        }

        async fn wait_until(&self, mut done: impl FnMut(&[Event]) -> bool) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !done(&self.events()) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("timed out waiting for events");
        }

        async fn wait_closed(&self, count: usize) {
            self.wait_until(|events| {
                events
                    .iter()
                    .filter(|e| matches!(e, Event::Closed(..)))
                    .count()
                    >= count
            })
            .await;
        }
    }

    impl Hooks for Recorder {
        fn on_channel(&self, ctx: &ChannelContext) -> Result<(), HookError> {
            if self.reject {
                return Err(HookError::new("not today"));
            }
            self.push(Event::Open(ctx.id.0));
            Ok(())
        }

        fn on_channel_closed(&self, ctx: &ChannelContext, err: Option<&ChannelError>) {
            self.push(Event::Closed(ctx.id.0, err.map(|e| e.to_string())));
        }
    }

    /// Records messages; replies to `ping`, fails on `fail`, refuses to
    /// route `unroutable`.
    struct RecordingHandler(Recorder);

    impl Handler for RecordingHandler {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn handle(&self, ctx: &ChannelContext, msg: &str) -> Result<(), HandlerError> {
            if msg == "fail" {
                return Err(HandlerError::new("asked to fail"));
            }
            self.0.push(Event::Message(ctx.id.0, msg.to_string()));
            if msg == "ping" {
                ctx.channel
                    .write("pong")
                    .map_err(|e| HandlerError::new(e.to_string()))?;
            }
            Ok(())
        }
    }

    struct RecordingRouter(RecordingHandler);

    impl Router for RecordingRouter {
        fn route(&self, _ctx: &ChannelContext, msg: &str) -> Result<&dyn Handler, RouteError> {
            if msg == "unroutable" {
                return Err(RouteError::new(msg));
            }
            Ok(&self.0)
        }
    }

    async fn wait_for_log(logs: &LogBuffer, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !logs.lines().iter().any(|l| l.contains(needle)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for log line");
    }

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            max_connections: 16,
            max_frame_size: 1024,
            client: ClientConfig {
                enabled: true,
                messages: 5,
                interval: Duration::from_millis(20),
                linger: Duration::ZERO,
                abortive_close: false,
            },
            log_level: "info".to_string(),
        }
    }

    fn start(config: Config, recorder: &Recorder) -> RunningServer {
        Server::builder(config)
            .hooks(recorder.clone())
            .router(RecordingRouter(RecordingHandler(recorder.clone())))
            .build()
            .bind()
            .unwrap()
    }

    async fn connect(server: &RunningServer) -> FrameWriter<TcpStream> {
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        FrameWriter::new(stream, VariableLengthCodec::with_max_frame_size(1024))
    }

    #[tokio::test]
    async fn test_sequential_connections_get_increasing_ids() {
        let recorder = Recorder::default();
        let server = start(test_config(), &recorder);

        for n in 1..=4 {
            let writer = connect(&server).await;
            recorder
                .wait_until(|events| events.contains(&Event::Open(n)))
                .await;
            drop(writer);
            recorder.wait_closed(n as usize).await;
        }

        let opened: Vec<Event> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Open(_)))
            .collect();
        assert_eq!(
            opened,
            vec![Event::Open(1), Event::Open(2), Event::Open(3), Event::Open(4)]
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_test_client_end_to_end() {
        let recorder = Recorder::default();
        let config = test_config();
        let server = start(config.clone(), &recorder);

        let sent = client::run_self_test(
            server.local_addr(),
            &config.client,
            VariableLengthCodec::new(),
        )
        .await
        .unwrap();
        assert_eq!(sent, 5);

        recorder.wait_closed(1).await;

        let mut expected = vec![Event::Open(1)];
        expected.extend((0..5).map(|i| Event::Message(1, format!("[msg{i}]hello server!"))));
        expected.push(Event::Closed(1, None));
        assert_eq!(recorder.events(), expected);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_frame_close_reports_error() {
        let recorder = Recorder::default();
        let server = start(test_config(), &recorder);

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        // Announces 10 bytes, sends 3
        stream.write_all(b"\x0ahel").await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        recorder.wait_closed(1).await;
        let closed = recorder.closed();
        assert_eq!(closed.len(), 1);
        match &closed[0] {
            Event::Closed(1, Some(err)) => assert!(err.contains("partial frame")),
            other => panic!("unexpected: {:?}", other),
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_close_reports_error() {
        let recorder = Recorder::default();
        let config = Config {
            client: ClientConfig {
                messages: 1,
                abortive_close: true,
                ..test_config().client
            },
            ..test_config()
        };
        let server = start(config.clone(), &recorder);

        client::run_self_test(server.local_addr(), &config.client, VariableLengthCodec::new())
            .await
            .unwrap();

        recorder.wait_closed(1).await;
        let closed = recorder.closed();
        assert_eq!(closed.len(), 1);
        assert!(matches!(&closed[0], Event::Closed(1, Some(_))));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_channel() {
        let recorder = Recorder::default();
        let server = start(test_config(), &recorder);

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut frame = BytesMut::new();
        VariableLengthCodec::with_max_frame_size(4096)
            .encode_frame(&[b'x'; 2048], &mut frame)
            .unwrap();
        stream.write_all(&frame).await.unwrap();

        recorder.wait_closed(1).await;
        match &recorder.closed()[0] {
            Event::Closed(1, Some(err)) => assert!(err.contains("frame too large")),
            other => panic!("unexpected: {:?}", other),
        }

        // Server closed its end
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_channel() {
        let recorder = Recorder::default();
        let server = start(test_config(), &recorder);

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(&[0x02, 0xff, 0xfe]).await.unwrap();

        recorder.wait_closed(1).await;
        match &recorder.closed()[0] {
            Event::Closed(1, Some(err)) => assert!(err.contains("utf-8")),
            other => panic!("unexpected: {:?}", other),
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_route_and_handler_failures_skip_message() {
        let recorder = Recorder::default();
        let server = start(test_config(), &recorder);

        let mut writer = connect(&server).await;
        for msg in ["first", "unroutable", "fail", "last"] {
            writer.send(msg).await.unwrap();
        }
        drop(writer);

        recorder.wait_closed(1).await;
        assert_eq!(
            recorder.events(),
            vec![
                Event::Open(1),
                Event::Message(1, "first".to_string()),
                Event::Message(1, "last".to_string()),
                Event::Closed(1, None),
            ]
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_reply_through_channel() {
        let recorder = Recorder::default();
        let server = start(test_config(), &recorder);

        let mut writer = connect(&server).await;
        writer.send("ping").await.unwrap();

        let mut stream = writer.into_inner();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"\x04pong");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_reply_survives_half_close() {
        let recorder = Recorder::default();
        let server = start(test_config(), &recorder);

        for _ in 0..20 {
            let mut writer = connect(&server).await;
            writer.send("ping").await.unwrap();

            let mut stream = writer.into_inner();
            stream.shutdown().await.unwrap();

            let mut reply = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reply, b"\x04pong");
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_reply_flushed_before_codec_error_close() {
        let recorder = Recorder::default();
        let server = start(test_config(), &recorder);

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        // "ping" followed by a frame with invalid utf-8, in one write
        stream.write_all(b"\x04ping\x02\xff\xfe").await.unwrap();

        let mut reply = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"\x04pong");

        recorder.wait_closed(1).await;
        assert!(matches!(&recorder.closed()[0], Event::Closed(1, Some(_))));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_default_hooks_log_channel_lifecycle() {
        let logs = LogBuffer::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let config = test_config();
        let server = Server::builder(config.clone()).build().bind().unwrap();

        client::run_self_test(server.local_addr(), &config.client, VariableLengthCodec::new())
            .await
            .unwrap();
        wait_for_log(&logs, "channel closed").await;
        server.shutdown().await;

        let lines = logs.channel_lines();
        assert_eq!(lines.len(), 7, "{lines:#?}");

        assert!(lines[0].contains("new channel"));
        assert!(lines[0].contains("id=1"));
        assert!(lines[0].contains("remote="));

        for (i, line) in lines[1..6].iter().enumerate() {
            assert!(line.contains("receive msg from channel"));
            assert!(line.contains("id=1"));
            assert!(line.contains(&format!("[msg{i}]hello server!")));
        }

        assert!(lines[6].contains("channel closed"));
        assert!(lines[6].contains("id=1"));
        assert!(!lines[6].contains("error="));
    }

    #[tokio::test]
    async fn test_default_hooks_log_abortive_close_error() {
        let logs = LogBuffer::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let config = Config {
            client: ClientConfig {
                messages: 1,
                abortive_close: true,
                ..test_config().client
            },
            ..test_config()
        };
        let server = Server::builder(config.clone()).build().bind().unwrap();

        client::run_self_test(server.local_addr(), &config.client, VariableLengthCodec::new())
            .await
            .unwrap();
        wait_for_log(&logs, "channel closed").await;
        server.shutdown().await;

        let closed: Vec<String> = logs
            .channel_lines()
            .into_iter()
            .filter(|l| l.contains("channel closed"))
            .collect();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].contains("id=1"));
        assert!(closed[0].contains("error="));
    }

    #[tokio::test]
    async fn test_rejected_channel_gets_no_close_hook() {
        let recorder = Recorder {
            reject: true,
            ..Recorder::default()
        };
        let server = start(test_config(), &recorder);

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.active_channels(), 0);

        server.shutdown().await;
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_registry_full_drops_connection() {
        let recorder = Recorder::default();
        let config = Config {
            max_connections: 1,
            ..test_config()
        };
        let server = start(config, &recorder);

        let _first = connect(&server).await;
        recorder
            .wait_until(|events| events.contains(&Event::Open(1)))
            .await;

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.active_channels(), 1);

        server.shutdown().await;
        assert_eq!(
            recorder.events(),
            vec![Event::Open(1), Event::Closed(1, None)]
        );
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_open_channels() {
        let recorder = Recorder::default();
        let server = start(test_config(), &recorder);

        let _a = connect(&server).await;
        let _b = connect(&server).await;
        recorder.wait_until(|events| events.len() == 2).await;
        assert_eq!(server.active_channels(), 2);

        server.shutdown().await;

        // Close hooks have all run by the time shutdown returns
        let mut closed = recorder.closed();
        closed.sort_by_key(|e| match e {
            Event::Closed(id, _) => *id,
            _ => 0,
        });
        assert_eq!(closed, vec![Event::Closed(1, None), Event::Closed(2, None)]);
    }

    #[test]
    fn test_bind_invalid_address() {
        let config = Config {
            listen: "not an address".to_string(),
            ..test_config()
        };
        let err = Server::builder(config).build().bind().err().unwrap();
        assert!(matches!(err, ServerError::Bind(..)));
    }
}
