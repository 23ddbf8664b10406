use crate::assembler::{Assembled, DropReason, FrameAssembler};
use crate::device::{Device, DeviceKind, DeviceProfile};
use crate::dispatch::{Dispatcher, ServerHooks};
use crate::error::{EctoError, Result};
use crate::serial::{FrameTiming, LineSettings, open_port};
use crate::slave::{SlaveHandle, SlaveRegistry};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const READ_BUFFER_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub line: LineSettings,
    /// Scales t1.5.
    ///
    /// Gaps are measured when the host reads each chunk, not when bytes hit
    /// the wire. USB adapters hand over data in ~1 ms packets, which is more
    /// than t1.5 at 19200 baud (~781 µs), so they need a multiplier of 2 or
    /// more to keep whole frames together.
    pub interchar_multiplier: f64,
    /// Scales t3.5.
    pub interframe_multiplier: f64,
    /// Report frames for unregistered slaves through the error hook instead
    /// of ignoring them.
    pub error_on_missing_slave: bool,
    pub broadcast_enable: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            line: LineSettings::default(),
            interchar_multiplier: 1.0,
            interframe_multiplier: 1.0,
            error_on_missing_slave: false,
            broadcast_enable: true,
        }
    }
}

impl ServerConfig {
    pub fn timing(&self) -> FrameTiming {
        FrameTiming::for_line(
            &self.line,
            self.interchar_multiplier,
            self.interframe_multiplier,
        )
    }
}

struct Running {
    cancel: CancellationToken,
    /// Cancelled by the read loop task on its way out, for whatever reason.
    exited: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// Modbus RTU slave server for one serial link.
///
/// Slaves can be added and removed while the server runs. Each slave's bank
/// has its own lock, so device updates from other tasks never wait on the
/// read loop for longer than one bank operation.
pub struct RtuServer {
    config: ServerConfig,
    registry: Arc<SlaveRegistry>,
    hooks: Arc<ServerHooks>,
    running: Option<Running>,
}

impl RtuServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(SlaveRegistry::new()),
            hooks: Arc::new(ServerHooks::new()),
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.registry
    }

    pub fn set_on_error(&self, hook: impl Fn(&EctoError) + Send + Sync + 'static) {
        self.hooks.set_on_error(hook);
    }

    pub fn set_on_request_handled(&self, hook: impl Fn(u8, &[u8], &[u8]) + Send + Sync + 'static) {
        self.hooks.set_on_request_handled(hook);
    }

    pub fn add_slave(&self, address: u8) -> Result<SlaveHandle> {
        self.registry.add_slave(address)
    }

    pub fn remove_slave(&self, address: u8) -> bool {
        self.registry.remove_slave(address).is_some()
    }

    pub fn slave(&self, address: u8) -> Option<SlaveHandle> {
        self.registry.get(address).map(|entry| entry.handle)
    }

    pub fn device(&self, address: u8) -> Option<Arc<Device>> {
        self.registry.device(address)
    }

    /// Register a slave and lay out a device of `kind` with its default
    /// profile on it.
    pub fn add_device(&self, address: u8, kind: DeviceKind) -> Result<Arc<Device>> {
        self.add_device_with(address, kind, kind.default_profile(), None)
    }

    pub fn add_device_with(
        &self,
        address: u8,
        kind: DeviceKind,
        profile: DeviceProfile,
        entity_id: Option<&str>,
    ) -> Result<Arc<Device>> {
        let slave = self.registry.add_slave(address)?;
        let device = Device::new(slave, kind, profile).and_then(|device| {
            let device = match entity_id {
                Some(entity_id) => device.with_entity_id(entity_id),
                None => device,
            };
            let device = Arc::new(device);
            self.registry.attach_device(Arc::clone(&device))?;
            Ok(device)
        });
        if device.is_err() {
            self.registry.remove_slave(address);
        }
        device
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Start serving on `transport`. Must be called from within a tokio runtime.
    pub fn start<T>(&mut self, transport: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_running() {
            return Err(EctoError::AlreadyRunning);
        }
        if let Some(stale) = self.running.take() {
            tracing::debug!("Discarding finished read loop");
            drop(stale);
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.hooks),
            self.config.error_on_missing_slave,
            self.config.broadcast_enable,
        );
        let timing = self.config.timing();
        let cancel = CancellationToken::new();
        tracing::info!(
            "Starting RTU server ({} slaves, t1.5 {:?}, t3.5 {:?})",
            self.registry.len(),
            timing.inter_char,
            timing.inter_frame
        );
        let exited = CancellationToken::new();
        let exit_guard = exited.clone().drop_guard();
        let loop_future = read_loop(
            transport,
            dispatcher,
            Arc::clone(&self.hooks),
            FrameAssembler::new(timing),
            cancel.clone(),
        );
        let task = tokio::spawn(async move {
            let _exit_guard = exit_guard;
            loop_future.await
        });
        self.running = Some(Running {
            cancel,
            exited,
            task,
        });
        Ok(())
    }

    /// Open `path` with the configured line settings and start serving on it.
    pub fn start_serial(&mut self, path: &str) -> Result<()> {
        let port = open_port(path, &self.config.line)?;
        self.start(port)
    }

    /// Completes once the read loop has exited, either through `stop` or
    /// because the link failed. Completes at once if the server is not started.
    /// The future does not borrow the server.
    pub fn finished(&self) -> impl Future<Output = ()> + Send + use<> {
        let exited = self.running.as_ref().map(|running| running.exited.clone());
        async move {
            if let Some(exited) = exited {
                exited.cancelled().await;
            }
        }
    }

    /// Stop the read loop and release the transport. Returns the loop's
    /// error if the link failed while running.
    pub async fn stop(&mut self) -> Result<()> {
        let running = self.running.take().ok_or(EctoError::NotRunning)?;
        running.cancel.cancel();
        let result = running
            .task
            .await
            .map_err(|e| EctoError::Io(io::Error::other(e.to_string())))?;
        tracing::info!("RTU server stopped");
        result
    }
}

impl Drop for RtuServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

enum LoopEvent {
    Cancelled,
    Read(io::Result<usize>),
    Silence,
}

async fn read_loop<T>(
    mut transport: T,
    dispatcher: Dispatcher,
    hooks: Arc<ServerHooks>,
    mut assembler: FrameAssembler,
    cancel: CancellationToken,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = [0u8; READ_BUFFER_LEN];

    loop {
        let deadline = assembler.deadline();
        let silence = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => LoopEvent::Cancelled,
            read = transport.read(&mut buf) => LoopEvent::Read(read),
            _ = silence => LoopEvent::Silence,
        };

        let completed = match event {
            LoopEvent::Cancelled => {
                tracing::debug!("Read loop cancelled");
                return Ok(());
            }
            LoopEvent::Read(Ok(0)) => {
                tracing::error!("Transport closed");
                return Err(EctoError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            LoopEvent::Read(Ok(n)) => {
                tracing::trace!("RX {:02X?}", &buf[..n]);
                assembler.feed(&buf[..n], Instant::now())
            }
            // an idle line is not an error
            LoopEvent::Read(Err(e)) if e.kind() == io::ErrorKind::TimedOut => continue,
            LoopEvent::Read(Err(e)) => {
                tracing::error!("Transport read failed: {}", e);
                return Err(e.into());
            }
            LoopEvent::Silence => assembler.poll(Instant::now()).into_iter().collect(),
        };

        for assembled in completed {
            let raw = match assembled {
                Assembled::Frame(raw) => raw,
                Assembled::Dropped { reason, len } => {
                    tracing::debug!("Dropped {} byte frame: {:?}", len, reason);
                    if reason == DropReason::Oversized {
                        hooks.error(&EctoError::OversizedFrame(len));
                    }
                    continue;
                }
            };

            if let Some(response) = dispatcher.dispatch(&raw) {
                tracing::trace!("TX {:02X?}", response);
                if let Err(e) = write_response(&mut transport, &response).await {
                    tracing::error!("Transport write failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
}

async fn write_response<T>(transport: &mut T, response: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    transport.write_all(response).await?;
    transport.flush().await
}
