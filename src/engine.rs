//! Async engine: one task per bundle.
//!
//! The task owns the [`Bundle`] and is the only code that touches it.
//! Inbound fragments, send requests and reconfiguration arrive as
//! [`Command`]s on a channel; the staleness reclaimer is an interval inside
//! the same `select!` loop, so it can never run concurrently with the inbound
//! path.
//!
//! [`BundleHandle::shutdown`] cancels the task and waits for it to return
//! the bundle. The reclaimer timer is dropped with the task, so it cannot
//! fire on a bundle that has been torn down.

use crate::bundle::{Bundle, BundleState, LinkTransport};
use crate::config::NodeConfig;
use crate::error::{MpError, TransportError};
use crate::link::LinkId;
use crate::reassembly::DatagramSink;
use crate::stats::BundleStats;
use log::{debug, trace};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Depth of a bundle's command queue.
pub const COMMAND_QUEUE_DEPTH: usize = 256;

/// Requests handled by a bundle task.
#[derive(Debug)]
pub enum Command {
    /// A frame arrived on a link.
    FragmentArrived { link: LinkId, frame: Vec<u8> },
    /// Fragment and send a datagram.
    Send {
        datagram: Vec<u8>,
        reply: oneshot::Sender<Result<usize, MpError>>,
    },
    /// Commit a new configuration.
    Configure {
        config: NodeConfig,
        reply: oneshot::Sender<Result<(), MpError>>,
    },
    /// Mark a link's transport as present.
    Attach {
        link: LinkId,
        reply: oneshot::Sender<Result<(), MpError>>,
    },
    /// Mark a link's transport as gone.
    Detach {
        link: LinkId,
        reply: oneshot::Sender<Result<(), MpError>>,
    },
    /// Report the bundle state.
    Snapshot { reply: oneshot::Sender<BundleState> },
}

/// Errors from talking to a bundle task.
#[derive(Debug)]
pub enum EngineError {
    /// The bundle task has stopped.
    Closed,
    /// The bundle rejected the request.
    Bundle(MpError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "bundle task stopped"),
            Self::Bundle(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Closed => None,
            Self::Bundle(e) => Some(e),
        }
    }
}

impl From<MpError> for EngineError {
    fn from(e: MpError) -> Self {
        Self::Bundle(e)
    }
}

/// Current time on the runtime clock.
///
/// Uses tokio's clock so paused-time tests drive the reclaimer.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Handle to a running bundle task.
///
/// Dropping the handle cancels the task.
pub struct BundleHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Bundle>>,
    stats: Arc<BundleStats>,
}

impl BundleHandle {
    /// Move `bundle` into a new task.
    ///
    /// Fragments go out through `transport`; reassembled datagrams go to
    /// `sink`. Must be called from within a tokio runtime.
    pub fn spawn<T, S>(bundle: Bundle, transport: T, sink: S) -> Self
    where
        T: LinkTransport + Send + 'static,
        S: DatagramSink + Send + 'static,
    {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let stats = bundle.stats().clone();
        let task = tokio::spawn(run(bundle, transport, sink, rx, cancel.clone()));
        Self {
            commands,
            cancel,
            task: Some(task),
            stats,
        }
    }

    /// Shared statistics of the bundle.
    pub fn stats(&self) -> &Arc<BundleStats> {
        &self.stats
    }

    /// Zero the bundle's statistics counters.
    ///
    /// Counters are shared atomics, so this does not wait for the task.
    pub fn clear_stats(&self) {
        self.stats.clear();
        debug!("{}: statistics cleared", self.stats.name());
    }

    /// Inbound port for one link, for use by its receive task.
    pub fn inbound(&self, link: LinkId) -> InboundLink {
        InboundLink {
            link,
            commands: self.commands.clone(),
        }
    }

    /// Queue a frame received on `link`.
    pub async fn fragment_arrived(&self, link: LinkId, frame: Vec<u8>) -> Result<(), EngineError> {
        self.commands
            .send(Command::FragmentArrived { link, frame })
            .await
            .map_err(|_| EngineError::Closed)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)
    }

    /// Fragment and send a datagram. Returns the number of fragments sent.
    pub async fn send(&self, datagram: Vec<u8>) -> Result<usize, EngineError> {
        Ok(self
            .request(|reply| Command::Send { datagram, reply })
            .await??)
    }

    /// Commit a new configuration.
    pub async fn configure(&self, config: NodeConfig) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| Command::Configure { config, reply })
            .await??)
    }

    /// Mark a link's transport as present.
    pub async fn attach_link(&self, link: LinkId) -> Result<(), EngineError> {
        Ok(self.request(|reply| Command::Attach { link, reply }).await??)
    }

    /// Mark a link's transport as gone.
    pub async fn detach_link(&self, link: LinkId) -> Result<(), EngineError> {
        Ok(self.request(|reply| Command::Detach { link, reply }).await??)
    }

    /// Current bundle state.
    pub async fn snapshot(&self) -> Result<BundleState, EngineError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the task and take the bundle back.
    pub async fn shutdown(mut self) -> Result<Bundle, EngineError> {
        self.cancel.cancel();
        let task = self.task.take().ok_or(EngineError::Closed)?;
        task.await.map_err(|_| EngineError::Closed)
    }
}

impl Drop for BundleHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sending side of one link's inbound path.
#[derive(Debug, Clone)]
pub struct InboundLink {
    link: LinkId,
    commands: mpsc::Sender<Command>,
}

impl InboundLink {
    /// Link this port feeds.
    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Hand a received frame to the bundle.
    pub async fn deliver(&self, frame: Vec<u8>) -> Result<(), EngineError> {
        self.commands
            .send(Command::FragmentArrived {
                link: self.link,
                frame,
            })
            .await
            .map_err(|_| EngineError::Closed)
    }
}

async fn run<T, S>(
    mut bundle: Bundle,
    mut transport: T,
    mut sink: S,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) -> Bundle
where
    T: LinkTransport,
    S: DatagramSink,
{
    let mut reclaim = tokio::time::interval(bundle.limits().reclaim_interval);
    reclaim.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{}: bundle task shutting down", bundle.name());
                break;
            }

            _ = reclaim.tick() => {
                bundle.reclaim(now(), &mut sink);
            }

            command = commands.recv() => {
                match command {
                    Some(command) => handle(&mut bundle, &mut transport, &mut sink, command),
                    None => {
                        debug!("{}: all handles dropped, stopping", bundle.name());
                        break;
                    }
                }
            }
        }
    }
    bundle
}

fn handle<T: LinkTransport, S: DatagramSink>(
    bundle: &mut Bundle,
    transport: &mut T,
    sink: &mut S,
    command: Command,
) {
    match command {
        Command::FragmentArrived { link, frame } => {
            if let Err(e) = bundle.receive(link, &frame, now(), sink) {
                trace!("{}: link {}: {}", bundle.name(), link, e);
            }
        }
        Command::Send { datagram, reply } => {
            let _ = reply.send(bundle.send(&datagram, transport, now()));
        }
        Command::Configure { config, reply } => {
            let _ = reply.send(bundle.configure(config));
        }
        Command::Attach { link, reply } => {
            let _ = reply.send(bundle.attach_link(link));
        }
        Command::Detach { link, reply } => {
            let _ = reply.send(bundle.detach_link(link));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(bundle.snapshot());
        }
    }
}

/// Link transport backed by one unbounded channel per link.
#[derive(Debug, Default, Clone)]
pub struct ChannelTransport {
    links: Vec<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ChannelTransport {
    /// Transport with no links connected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `link` and return the receiving end of its channel.
    pub fn connect(&mut self, link: LinkId) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if self.links.len() <= link {
            self.links.resize(link + 1, None);
        }
        self.links[link] = Some(tx);
        rx
    }
}

impl LinkTransport for ChannelTransport {
    fn send_fragment(&mut self, link: LinkId, frame: Vec<u8>) -> Result<(), TransportError> {
        let tx = self
            .links
            .get(link)
            .and_then(Option::as_ref)
            .ok_or_else(|| format!("link {} not connected", link))?;
        tx.send(frame)
            .map_err(|_| format!("link {} receiver closed", link).into())
    }
}

impl DatagramSink for mpsc::UnboundedSender<Vec<u8>> {
    fn deliver(&mut self, datagram: Vec<u8>) {
        if self.send(datagram).is_err() {
            trace!("datagram receiver closed, discarding");
        }
    }
}
