//! Connection lifecycle management
//!
//! [`ConnectionManager`] owns the connection state machine: a passive
//! listener and at most one outbound attempt race to establish a link,
//! whichever completes first wins, and exactly one link is current at any
//! time. All state mutation happens under a single mutex guarding the state
//! and the current-link pointer; raw link I/O runs outside it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use super::ConnectionEvent;
use crate::link::{LinkListener, LinkProvider, LinkRole, TransportLink};
use crate::protocol::{framer, ProtocolError};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Doing nothing.
    Idle,
    /// Listening for an inbound connection.
    Listening,
    /// An outbound attempt is in flight.
    Connecting,
    /// A link is established and usable.
    Connected,
    /// The outbound attempt failed; a new `connect` is required.
    Failed,
    /// The active link dropped; re-entry to `Listening` is automatic.
    Lost,
}

/// Connection manager configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerConfig {
    /// Which peer role (and thus which RFCOMM service UUID) this
    /// deployment uses.
    pub role: LinkRole,
}

struct Shared {
    state: ConnectionState,
    link: Option<Arc<dyn TransportLink>>,
    listener: Option<Arc<dyn LinkListener>>,
    connect_cancel: Option<Arc<AtomicBool>>,
    /// Bumped by `stop()`; a worker spawned under an older generation may
    /// not install a link.
    generation: u64,
}

#[derive(Default)]
struct Tasks {
    listen: Option<JoinHandle<()>>,
    connect: Option<JoinHandle<()>>,
}

struct Inner {
    provider: Arc<dyn LinkProvider>,
    shared: Mutex<Shared>,
    tasks: Mutex<Tasks>,
    events: Sender<ConnectionEvent>,
    /// Serializes logical request/response pairs across callers.
    gate: Mutex<()>,
}

/// The connection lifecycle state machine.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager over `provider`. Returns the manager and the
    /// receiving end of the observer event channel.
    pub fn new(
        provider: impl LinkProvider + 'static,
        config: ManagerConfig,
    ) -> (Self, Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel();
        tracing::info!(role = ?config.role, uuid = %config.role.service_uuid(),
            "connection manager created");
        let inner = Arc::new(Inner {
            provider: Arc::new(provider),
            shared: Mutex::new(Shared {
                state: ConnectionState::Idle,
                link: None,
                listener: None,
                connect_cancel: None,
                generation: 0,
            }),
            tasks: Mutex::new(Tasks::default()),
            events: tx,
            gate: Mutex::new(()),
        });
        (Self { inner }, rx)
    }

    /// Non-blocking state snapshot, safe from any thread.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared_lock().state
    }

    /// Enter listening mode. Cancels any pending outbound attempt and
    /// closes the active link, then starts the passive listener. Also the
    /// recovery target after a lost connection.
    pub fn start(&self) -> Result<(), ProtocolError> {
        let mut shared = self.inner.shared_lock();
        if let Some(cancel) = shared.connect_cancel.take() {
            cancel.store(true, Ordering::SeqCst);
        }
        if let Some(link) = shared.link.take() {
            link.shutdown();
        }
        if shared.listener.is_some() {
            self.inner.set_state(&mut shared, ConnectionState::Listening);
            return Ok(());
        }
        Inner::begin_listening(&self.inner, &mut shared)
    }

    /// Start an outbound attempt to `peer`. A pending attempt is cancelled
    /// first; the passive listener keeps racing. Failure moves the state to
    /// `Failed` without retrying.
    pub fn connect(&self, peer: &str) {
        let mut shared = self.inner.shared_lock();
        if let Some(cancel) = shared.connect_cancel.take() {
            cancel.store(true, Ordering::SeqCst);
        }
        if let Some(link) = shared.link.take() {
            link.shutdown();
        }
        let cancel = Arc::new(AtomicBool::new(false));
        shared.connect_cancel = Some(Arc::clone(&cancel));
        self.inner.set_state(&mut shared, ConnectionState::Connecting);
        let generation = shared.generation;
        drop(shared);

        let inner = Arc::clone(&self.inner);
        let peer = peer.to_string();
        let handle = std::thread::spawn(move || {
            connect_worker(inner, peer, cancel, generation);
        });
        // a replaced handle belongs to a cancelled attempt; let it run out
        self.inner.tasks_lock().connect = Some(handle);
    }

    /// Tear everything down: cancel establishment attempts, close the
    /// current link, join the workers. Idempotent.
    pub fn stop(&self) {
        {
            let mut shared = self.inner.shared_lock();
            shared.generation += 1;
            if let Some(cancel) = shared.connect_cancel.take() {
                cancel.store(true, Ordering::SeqCst);
            }
            if let Some(listener) = shared.listener.take() {
                listener.close();
            }
            if let Some(link) = shared.link.take() {
                link.shutdown();
            }
            self.inner.set_state(&mut shared, ConnectionState::Idle);
        }
        let (listen, connect) = {
            let mut tasks = self.inner.tasks_lock();
            (tasks.listen.take(), tasks.connect.take())
        };
        if let Some(handle) = listen {
            let _ = handle.join();
        }
        if let Some(handle) = connect {
            let _ = handle.join();
        }
        tracing::debug!("connection manager stopped");
    }

    /// Write `bytes` to the current link.
    ///
    /// Returns `NotConnected` without touching any transport when no link
    /// is current. A write failure demotes the connection to `Lost` and
    /// re-enters listening before returning.
    pub fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let link = self.current_link()?;
        match link.write(bytes) {
            Ok(()) => {
                self.inner.emit(ConnectionEvent::BytesSent(bytes.to_vec()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "write failed, dropping link");
                Inner::connection_lost(&self.inner, &link);
                Err(ProtocolError::ConnectionLost)
            }
        }
    }

    /// Block until a complete frame arrives on the current link.
    ///
    /// Returns `Ok(None)` when the link fails mid-read (after demoting the
    /// connection to `Lost` and re-entering listening), `NotConnected`
    /// when no link is current.
    pub fn read_frame(&self) -> Result<Option<String>, ProtocolError> {
        let link = self.current_link()?;
        match framer::read_raw_frame(&*link) {
            Ok(Some(frame)) => {
                self.inner
                    .emit(ConnectionEvent::BytesReceived(frame.clone().into_bytes(), frame.len()));
                Ok(Some(frame))
            }
            Ok(None) => {
                Inner::connection_lost(&self.inner, &link);
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "read failed, dropping link");
                Inner::connection_lost(&self.inner, &link);
                Ok(None)
            }
        }
    }

    /// Serializes request/response pairs; held for the duration of one
    /// command transaction.
    pub(crate) fn command_gate(&self) -> MutexGuard<'_, ()> {
        self.inner.gate.lock().expect("command gate poisoned")
    }

    fn current_link(&self) -> Result<Arc<dyn TransportLink>, ProtocolError> {
        let shared = self.inner.shared_lock();
        if shared.state != ConnectionState::Connected {
            return Err(ProtocolError::NotConnected);
        }
        shared
            .link
            .as_ref()
            .cloned()
            .ok_or(ProtocolError::NotConnected)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn shared_lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("connection state poisoned")
    }

    fn tasks_lock(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().expect("task slots poisoned")
    }

    fn emit(&self, event: ConnectionEvent) {
        // observer gone is not our problem
        let _ = self.events.send(event);
    }

    fn set_state(&self, shared: &mut Shared, state: ConnectionState) {
        if shared.state == state {
            return;
        }
        tracing::debug!(from = ?shared.state, to = ?state, "state transition");
        shared.state = state;
        self.emit(ConnectionEvent::StateChanged(state));
    }

    /// Create the listener and spawn the accept worker. Caller holds the
    /// shared lock.
    fn begin_listening(inner: &Arc<Self>, shared: &mut Shared) -> Result<(), ProtocolError> {
        let listener: Arc<dyn LinkListener> = match inner.provider.listen() {
            Ok(listener) => Arc::from(listener),
            Err(e) => {
                tracing::warn!(error = %e, "cannot enter listening mode");
                inner.emit(ConnectionEvent::Notice(format!("Listen failed: {e}")));
                return Err(ProtocolError::ListenFailed(e.to_string()));
            }
        };
        shared.listener = Some(Arc::clone(&listener));
        inner.set_state(shared, ConnectionState::Listening);
        let generation = shared.generation;

        let worker_inner = Arc::clone(inner);
        let handle = std::thread::spawn(move || {
            listen_worker(worker_inner, listener, generation);
        });
        inner.tasks_lock().listen = Some(handle);
        Ok(())
    }

    /// Install a freshly established link as current, closing the loser of
    /// the establishment race and any previously-current link.
    ///
    /// Rejected (link closed, `false` returned) when the state is no longer
    /// Listening/Connecting or the generation is stale; this guards against
    /// an in-progress attempt racing a `stop()` or an already-won race.
    fn install_link(&self, link: Arc<dyn TransportLink>, generation: u64) -> bool {
        let mut shared = self.shared_lock();
        let accepting = matches!(
            shared.state,
            ConnectionState::Listening | ConnectionState::Connecting
        );
        if shared.generation != generation || !accepting {
            tracing::debug!(state = ?shared.state, "rejecting superfluous link");
            link.shutdown();
            return false;
        }
        if let Some(old) = shared.link.take() {
            old.shutdown();
        }
        if let Some(listener) = shared.listener.take() {
            listener.close();
        }
        if let Some(cancel) = shared.connect_cancel.take() {
            cancel.store(true, Ordering::SeqCst);
        }
        let peer = link.peer().to_string();
        shared.link = Some(link);
        self.set_state(&mut shared, ConnectionState::Connected);
        tracing::info!(peer = %peer, "link established");
        self.emit(ConnectionEvent::DeviceIdentified(peer));
        true
    }

    /// The outbound attempt failed. No automatic retry.
    fn connection_failed(&self, generation: u64, error: std::io::Error) {
        let mut shared = self.shared_lock();
        if shared.generation != generation || shared.state != ConnectionState::Connecting {
            return;
        }
        self.set_state(&mut shared, ConnectionState::Failed);
        self.emit(ConnectionEvent::Notice("Unable to connect device".into()));
        tracing::warn!(error = %error, "outbound attempt failed");
    }

    /// The active link failed. Demote to Lost, then immediately re-enter
    /// listening so a future reconnect succeeds without an explicit
    /// restart.
    fn connection_lost(inner: &Arc<Self>, failing: &Arc<dyn TransportLink>) {
        let mut shared = inner.shared_lock();
        let is_current = shared
            .link
            .as_ref()
            .map(|l| Arc::ptr_eq(l, failing))
            .unwrap_or(false);
        if shared.state != ConnectionState::Connected || !is_current {
            // a concurrent reader/writer already handled this loss
            return;
        }
        if let Some(link) = shared.link.take() {
            link.shutdown();
        }
        inner.set_state(&mut shared, ConnectionState::Lost);
        inner.emit(ConnectionEvent::Notice("Device connection was lost".into()));
        if let Err(e) = Inner::begin_listening(inner, &mut shared) {
            tracing::warn!(error = %e, "could not re-enter listening after loss");
        }
    }
}

fn listen_worker(inner: Arc<Inner>, listener: Arc<dyn LinkListener>, generation: u64) {
    tracing::debug!("listen worker started");
    loop {
        match listener.accept() {
            Ok(link) => {
                if inner.install_link(Arc::from(link), generation) {
                    break;
                }
                // rejected socket closed by install_link; keep listening
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => break,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed, listen worker exiting");
                break;
            }
        }
    }
    tracing::debug!("listen worker exiting");
}

fn connect_worker(inner: Arc<Inner>, peer: String, cancel: Arc<AtomicBool>, generation: u64) {
    tracing::debug!(peer = %peer, "connect worker started");
    match inner.provider.connect(&peer) {
        Ok(link) => {
            if cancel.load(Ordering::SeqCst) {
                link.shutdown();
                return;
            }
            inner.install_link(Arc::from(link), generation);
        }
        Err(e) => {
            if !cancel.load(Ordering::SeqCst) {
                inner.connection_failed(generation, e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted links and providers for state-machine tests.

    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::mpsc::RecvTimeoutError;
    use std::sync::Condvar;
    use std::time::Duration;

    #[derive(Default)]
    pub struct MockLinkState {
        pub closed: AtomicBool,
        pub fail_writes: AtomicBool,
        pub writes: Mutex<Vec<Vec<u8>>>,
        incoming: Mutex<VecDeque<u8>>,
        wakeup: Condvar,
    }

    impl MockLinkState {
        pub fn push_bytes(&self, bytes: &[u8]) {
            self.incoming
                .lock()
                .unwrap()
                .extend(bytes.iter().copied());
            self.wakeup.notify_all();
        }

        pub fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    pub struct MockLink {
        pub state: Arc<MockLinkState>,
        peer: String,
    }

    impl MockLink {
        pub fn new(peer: &str) -> (Box<dyn TransportLink>, Arc<MockLinkState>) {
            let state = Arc::new(MockLinkState::default());
            (
                Box::new(MockLink {
                    state: Arc::clone(&state),
                    peer: peer.to_string(),
                }),
                state,
            )
        }
    }

    impl TransportLink for MockLink {
        fn peer(&self) -> &str {
            &self.peer
        }

        fn write(&self, buf: &[u8]) -> io::Result<()> {
            if self.state.fail_writes.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted failure"));
            }
            self.state.writes.lock().unwrap().push(buf.to_vec());
            Ok(())
        }

        fn read_byte(&self) -> io::Result<Option<u8>> {
            let mut incoming = self.state.incoming.lock().unwrap();
            loop {
                if let Some(byte) = incoming.pop_front() {
                    return Ok(Some(byte));
                }
                if self.state.closed.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                let (guard, _) = self
                    .state
                    .wakeup
                    .wait_timeout(incoming, Duration::from_millis(5))
                    .unwrap();
                incoming = guard;
            }
        }

        fn shutdown(&self) {
            self.state.closed.store(true, Ordering::SeqCst);
            self.state.wakeup.notify_all();
        }
    }

    pub struct MockListener {
        inbound: Mutex<mpsc::Receiver<Box<dyn TransportLink>>>,
        closed: AtomicBool,
    }

    impl LinkListener for MockListener {
        fn accept(&self) -> io::Result<Box<dyn TransportLink>> {
            let inbound = self.inbound.lock().unwrap();
            loop {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "closed"));
                }
                match inbound.recv_timeout(Duration::from_millis(5)) {
                    Ok(link) => return Ok(link),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(io::Error::new(io::ErrorKind::Interrupted, "closed"))
                    }
                }
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub struct MockProvider {
        pub connect_results: Mutex<VecDeque<io::Result<Box<dyn TransportLink>>>>,
        inbound_rx: Mutex<Option<mpsc::Receiver<Box<dyn TransportLink>>>>,
    }

    impl MockProvider {
        /// Provider plus the sending side used to script inbound
        /// connections.
        pub fn new() -> (Self, mpsc::Sender<Box<dyn TransportLink>>) {
            let (tx, rx) = mpsc::channel();
            (
                Self {
                    connect_results: Mutex::new(VecDeque::new()),
                    inbound_rx: Mutex::new(Some(rx)),
                },
                tx,
            )
        }
    }

    impl LinkProvider for MockProvider {
        fn listen(&self) -> io::Result<Box<dyn LinkListener>> {
            // the first listen consumes the scripted receiver; later
            // listeners get a dead channel and simply never accept
            let rx = self
                .inbound_rx
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| mpsc::channel().1);
            Ok(Box::new(MockListener {
                inbound: Mutex::new(rx),
                closed: AtomicBool::new(false),
            }))
        }

        fn connect(&self, _peer: &str) -> io::Result<Box<dyn TransportLink>> {
            self.connect_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::NotFound, "unscripted")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn drain(rx: &Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn start_reaches_listening() {
        let (provider, _inbound) = MockProvider::new();
        let (manager, events) = ConnectionManager::new(provider, ManagerConfig::default());
        assert_eq!(manager.state(), ConnectionState::Idle);

        manager.start().unwrap();
        assert_eq!(manager.state(), ConnectionState::Listening);
        assert!(drain(&events)
            .contains(&ConnectionEvent::StateChanged(ConnectionState::Listening)));
        manager.stop();
    }

    #[test]
    fn inbound_accept_reaches_connected_with_one_identification() {
        let (provider, inbound) = MockProvider::new();
        let (manager, events) = ConnectionManager::new(provider, ManagerConfig::default());
        manager.start().unwrap();

        let (link, _state) = MockLink::new("OBDII");
        inbound.send(link).unwrap();
        wait_until(|| manager.state() == ConnectionState::Connected);

        let seen = drain(&events);
        let identified: Vec<_> = seen
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::DeviceIdentified(_)))
            .collect();
        assert_eq!(identified.len(), 1);
        assert_eq!(
            identified[0],
            &ConnectionEvent::DeviceIdentified("OBDII".into())
        );
        manager.stop();
    }

    #[test]
    fn write_failure_demotes_to_lost_then_listening_in_same_call() {
        let (provider, inbound) = MockProvider::new();
        let (manager, events) = ConnectionManager::new(provider, ManagerConfig::default());
        manager.start().unwrap();

        let (link, state) = MockLink::new("OBDII");
        inbound.send(link).unwrap();
        wait_until(|| manager.state() == ConnectionState::Connected);
        let _ = drain(&events);

        state.fail_writes.store(true, Ordering::SeqCst);
        let err = manager.write(b"01 0C\r").unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionLost));
        // re-entry happened inside the write call, not eventually
        assert_eq!(manager.state(), ConnectionState::Listening);

        let seen = drain(&events);
        let states: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![ConnectionState::Lost, ConnectionState::Listening]);
        let notices = seen
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Notice(m) if m.contains("lost")))
            .count();
        assert_eq!(notices, 1);
        manager.stop();
    }

    #[test]
    fn stop_closes_link_and_is_idempotent() {
        let (provider, inbound) = MockProvider::new();
        let (manager, _events) = ConnectionManager::new(provider, ManagerConfig::default());
        manager.start().unwrap();

        let (link, state) = MockLink::new("OBDII");
        inbound.send(link).unwrap();
        wait_until(|| manager.state() == ConnectionState::Connected);

        manager.stop();
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(state.closed.load(Ordering::SeqCst));

        manager.stop();
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[test]
    fn io_refused_when_not_connected() {
        let (provider, _inbound) = MockProvider::new();
        let (manager, _events) = ConnectionManager::new(provider, ManagerConfig::default());

        assert!(matches!(
            manager.write(b"AT Z\r").unwrap_err(),
            ProtocolError::NotConnected
        ));
        assert!(matches!(
            manager.read_frame().unwrap_err(),
            ProtocolError::NotConnected
        ));
    }

    #[test]
    fn not_connected_write_touches_no_transport() {
        let (provider, inbound) = MockProvider::new();
        let (manager, _events) = ConnectionManager::new(provider, ManagerConfig::default());
        manager.start().unwrap();

        let (link, state) = MockLink::new("OBDII");
        inbound.send(link).unwrap();
        wait_until(|| manager.state() == ConnectionState::Connected);
        manager.stop();

        assert!(matches!(
            manager.write(b"01 0C\r").unwrap_err(),
            ProtocolError::NotConnected
        ));
        assert_eq!(state.write_count(), 0);
    }

    #[test]
    fn outbound_failure_reaches_failed_without_retry() {
        let (provider, _inbound) = MockProvider::new();
        // connect_results is empty: every attempt errors
        let (manager, events) = ConnectionManager::new(provider, ManagerConfig::default());

        manager.connect("AA:BB:CC:DD:EE:FF");
        wait_until(|| manager.state() == ConnectionState::Failed);
        // it stays Failed; no listener was running, no auto-retry
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(manager.state(), ConnectionState::Failed);

        let notices = drain(&events)
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Notice(m) if m.contains("Unable")))
            .count();
        assert_eq!(notices, 1);
        manager.stop();
    }

    #[test]
    fn outbound_success_reaches_connected() {
        let (provider, _inbound) = MockProvider::new();
        let (link, _state) = MockLink::new("adapter");
        provider.connect_results.lock().unwrap().push_back(Ok(link));
        let (manager, _events) = ConnectionManager::new(provider, ManagerConfig::default());

        manager.connect("adapter");
        wait_until(|| manager.state() == ConnectionState::Connected);
        manager.stop();
    }

    #[test]
    fn read_frame_returns_payload_before_prompt() {
        let (provider, inbound) = MockProvider::new();
        let (manager, events) = ConnectionManager::new(provider, ManagerConfig::default());
        manager.start().unwrap();

        let (link, state) = MockLink::new("OBDII");
        inbound.send(link).unwrap();
        wait_until(|| manager.state() == ConnectionState::Connected);
        let _ = drain(&events);

        state.push_bytes(b"41 0C 1A F8 \r\r>");
        let frame = manager.read_frame().unwrap().unwrap();
        assert_eq!(frame, "41 0C 1A F8 \r\r");
        assert!(drain(&events)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::BytesReceived(_, n) if *n == frame.len())));
        manager.stop();
    }
}
