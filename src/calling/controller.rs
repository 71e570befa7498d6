//! Call lifecycle for one trip: the API the trip UI drives.
//!
//! Inputs (signals from the transport, events from the current peer
//! connection) are funneled through one queue and handled one at a time
//! under the session lock, so the negotiator never sees two things at once.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::signaling::transport::SignalingTransport;
use crate::signaling::Signal;
use crate::trip::Trip;

use super::events::{CallEvent, EventHub, EventKind};
use super::media::{LocalMedia, MediaAccessError, MediaConstraints, MediaDevices, MediaStream};
use super::negotiation::{Effect, Negotiator};
use super::peer::{PeerConnection, PeerEvent, PeerFactory};
use super::CallError;
#[cfg(test)]
use super::{CallRole, NegotiationState};

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub media_timeout: Duration,
    pub constraints: MediaConstraints,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            media_timeout: Duration::from_secs(10),
            constraints: MediaConstraints::default(),
        }
    }
}

enum Input {
    Signal(Signal),
    Peer { epoch: u64, event: PeerEvent },
}

struct Session {
    negotiator: Negotiator,
    local_media: Option<LocalMedia>,
    /// Listening mode. Survives calls; cleared only by `destroy`.
    listening: bool,
    /// Bumped for every new peer connection.
    epoch: u64,
    destroyed: bool,
}

struct Shared {
    trip_id: String,
    local_user: String,
    remote_user: String,
    transport: Arc<SignalingTransport>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerFactory>,
    settings: CallSettings,
    events: EventHub,
    inputs: mpsc::UnboundedSender<Input>,
    session: tokio::sync::Mutex<Session>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct CallController {
    shared: Arc<Shared>,
}

impl CallController {
    pub fn new(
        trip_id: &str,
        local_user: &str,
        remote_user: &str,
        transport: Arc<SignalingTransport>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
        settings: CallSettings,
    ) -> Self {
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            trip_id: trip_id.to_string(),
            local_user: local_user.to_string(),
            remote_user: remote_user.to_string(),
            transport,
            devices,
            peers,
            settings,
            events: EventHub::new(),
            inputs,
            session: tokio::sync::Mutex::new(Session {
                negotiator: Negotiator::new(local_user, remote_user),
                local_media: None,
                listening: false,
                epoch: 0,
                destroyed: false,
            }),
            tasks: Mutex::new(Vec::new()),
        });

        let pump = tokio::spawn(pump_inputs(Arc::downgrade(&shared), input_rx));
        let forward = tokio::spawn(forward_signals(
            shared.transport.subscribe_signals(),
            shared.inputs.clone(),
        ));
        shared.tasks.lock().extend([pump, forward]);

        tracing::debug!(
            "Call controller for trip {} ({} <-> {})",
            trip_id,
            local_user,
            remote_user
        );
        Self { shared }
    }

    /// Controller for `trip` as seen by `local_user`. Fails until the trip
    /// has a counterpart.
    pub fn for_trip(
        trip: &Trip,
        local_user: &str,
        transport: Arc<SignalingTransport>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
        settings: CallSettings,
    ) -> Result<Self, CallError> {
        let remote = trip.counterpart(local_user).ok_or(CallError::NoCounterpart)?;
        Ok(Self::new(
            &trip.id, local_user, remote, transport, devices, peers, settings,
        ))
    }

    pub fn trip_id(&self) -> &str {
        &self.shared.trip_id
    }

    pub fn remote_user(&self) -> &str {
        &self.shared.remote_user
    }

    /// Join the trip's call channel and watch for incoming calls. Idempotent.
    pub async fn start_listening(&self) -> Result<(), CallError> {
        let shared = &self.shared;
        let mut session = shared.session.lock().await;
        if session.destroyed {
            return Err(CallError::Destroyed);
        }
        shared.open_channel().await?;
        if !session.listening {
            tracing::info!("Listening for calls on trip {}", shared.trip_id);
        }
        session.listening = true;
        session.negotiator.listen();
        shared.apply(&mut session);
        Ok(())
    }

    /// Call the trip counterpart. Returns the local stream for preview.
    pub async fn initiate_call(&self) -> Result<MediaStream, CallError> {
        let shared = &self.shared;
        shared.ensure_can_start().await?;

        let media = shared.acquire_media().await?;
        shared.ensure_alive().await?;
        let opened_here = shared.open_channel().await?;

        let mut session = shared.session.lock().await;
        if session.destroyed {
            // Destroyed while the channel was opening; it must stay closed.
            shared.transport.close();
            return Err(CallError::Destroyed);
        }
        let result = match shared.prepare_peer(&mut session, &media).await {
            Ok(pc) => session.negotiator.initiate(pc).await,
            Err(e) => Err(e),
        };
        shared.finish_start(&mut session, media, opened_here, result)
    }

    /// Pick up the ringing call. Returns the local stream for preview.
    pub async fn answer_call(&self) -> Result<MediaStream, CallError> {
        let shared = &self.shared;
        {
            let session = shared.session.lock().await;
            if session.destroyed {
                return Err(CallError::Destroyed);
            }
            if !session.negotiator.has_pending_offer() {
                let state = session.negotiator.state();
                return Err(if state.is_in_call() {
                    CallError::CallInProgress(state)
                } else {
                    CallError::NoIncomingCall
                });
            }
        }

        let media = shared.acquire_media().await?;
        shared.ensure_alive().await?;
        let opened_here = shared.open_channel().await?;

        let mut session = shared.session.lock().await;
        if session.destroyed {
            shared.transport.close();
            return Err(CallError::Destroyed);
        }
        if !session.negotiator.has_pending_offer() {
            // Caller gave up while we were getting the camera.
            shared.release_channel(&session, opened_here);
            return Err(CallError::NoIncomingCall);
        }
        let result = match shared.prepare_peer(&mut session, &media).await {
            Ok(pc) => session.negotiator.answer(pc).await,
            Err(e) => Err(e),
        };
        shared.finish_start(&mut session, media, opened_here, result)
    }

    /// Refuse the ringing call and keep listening.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        let mut session = self.shared.session.lock().await;
        if session.destroyed {
            return Err(CallError::Destroyed);
        }
        session.negotiator.decline()?;
        self.shared.apply(&mut session);
        Ok(())
    }

    /// Hang up. Safe to call in any state and more than once.
    pub async fn end_call(&self) {
        let mut session = self.shared.session.lock().await;
        if session.destroyed {
            return;
        }
        session.negotiator.hang_up().await;
        self.shared.apply(&mut session);
    }

    /// Tear everything down, including the signaling channel. Terminal.
    pub async fn destroy(&self) {
        let shared = &self.shared;
        let mut session = shared.session.lock().await;
        if session.destroyed {
            return;
        }
        session.listening = false;
        session.negotiator.reset().await;
        shared.apply(&mut session);
        session.local_media = None;
        session.destroyed = true;
        shared.transport.close();
        for task in shared.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Call controller for trip {} destroyed", shared.trip_id);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CallEvent> {
        self.shared.events.subscribe()
    }

    /// Run `handler` for every incoming call, including one already ringing.
    pub fn on_incoming_call<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + 'static,
    {
        let mut events = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let CallEvent::IncomingCall { from } = event {
                    handler(&from);
                }
            }
        });
        self.shared.track_task(task);
    }

    /// Run `handler` whenever the far end's media becomes available.
    pub fn on_remote_stream<F>(&self, handler: F)
    where
        F: Fn(MediaStream) + Send + 'static,
    {
        let mut events = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let CallEvent::RemoteStream(stream) = event {
                    handler(stream);
                }
            }
        });
        self.shared.track_task(task);
    }

    #[cfg(test)]
    pub async fn state(&self) -> NegotiationState {
        self.shared.session.lock().await.negotiator.state()
    }

    #[cfg(test)]
    pub async fn role(&self) -> Option<CallRole> {
        self.shared.session.lock().await.negotiator.role()
    }

    /// Participants on the trip's call channel. Diagnostic only.
    pub fn presence(&self) -> watch::Receiver<usize> {
        self.shared.transport.presence()
    }

    /// Follow trip updates: listen once the trip is active, destroy once it
    /// is over.
    pub fn follow_trip(&self, mut updates: broadcast::Receiver<Trip>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                let trip = match updates.recv().await {
                    Ok(trip) => trip,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Missed {} trip updates", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if trip.id != controller.trip_id() {
                    continue;
                }
                if trip.status.is_terminal() {
                    tracing::info!("Trip {} is {}, ending calls", trip.id, trip.status);
                    controller.destroy().await;
                    break;
                }
                if trip.status.is_active() {
                    if let Err(e) = controller.start_listening().await {
                        tracing::warn!("Could not listen for calls on trip {}: {}", trip.id, e);
                    }
                }
            }
        })
    }
}

impl Shared {
    async fn ensure_alive(&self) -> Result<(), CallError> {
        if self.session.lock().await.destroyed {
            return Err(CallError::Destroyed);
        }
        Ok(())
    }

    async fn ensure_can_start(&self) -> Result<(), CallError> {
        let session = self.session.lock().await;
        if session.destroyed {
            return Err(CallError::Destroyed);
        }
        let state = session.negotiator.state();
        if state.is_in_call() {
            return Err(CallError::CallInProgress(state));
        }
        Ok(())
    }

    async fn acquire_media(&self) -> Result<LocalMedia, CallError> {
        let timeout = self.settings.media_timeout;
        let capture = self.devices.get_user_media(self.settings.constraints);
        match tokio::time::timeout(timeout, capture).await {
            Ok(Ok(stream)) => Ok(LocalMedia::new(stream)),
            Ok(Err(e)) => {
                tracing::warn!("Media access failed: {}", e);
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!("Media access timed out after {:?}", timeout);
                Err(MediaAccessError::Timeout(timeout).into())
            }
        }
    }

    /// Open the trip channel and announce ourselves on it. True if it was
    /// not open before.
    async fn open_channel(&self) -> Result<bool, CallError> {
        let was_open = self.transport.is_open_for(&self.trip_id);
        self.transport.open(&self.trip_id).await?;
        self.transport.track_presence(&self.local_user);
        Ok(!was_open)
    }

    fn release_channel(&self, session: &Session, opened_here: bool) {
        if opened_here && !session.listening {
            self.transport.close();
        }
    }

    /// New peer connection wired to this session, carrying the local tracks.
    async fn prepare_peer(
        &self,
        session: &mut Session,
        media: &LocalMedia,
    ) -> Result<Box<dyn PeerConnection>, CallError> {
        session.epoch += 1;
        let epoch = session.epoch;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pc = self.peers.create(tx).await?;
        let inputs = self.inputs.clone();
        self.track_task(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if inputs.send(Input::Peer { epoch, event }).is_err() {
                    break;
                }
            }
        }));

        for track in media.stream().tracks() {
            if let Err(e) = pc.add_track(track).await {
                pc.close().await;
                return Err(e.into());
            }
        }
        Ok(pc)
    }

    fn finish_start(
        &self,
        session: &mut Session,
        media: LocalMedia,
        opened_here: bool,
        result: Result<(), CallError>,
    ) -> Result<MediaStream, CallError> {
        match result {
            Ok(()) => {
                let stream = media.stream().clone();
                session.local_media = Some(media);
                self.apply(session);
                Ok(stream)
            }
            Err(e) => {
                drop(media);
                self.apply(session);
                self.release_channel(session, opened_here);
                tracing::warn!("Call setup failed: {}", e);
                Err(e)
            }
        }
    }

    async fn process(&self, input: Input) {
        let mut session = self.session.lock().await;
        if session.destroyed {
            return;
        }
        match input {
            Input::Signal(signal) => session.negotiator.handle_signal(signal).await,
            Input::Peer { epoch, event } => {
                if epoch != session.epoch {
                    tracing::debug!("Dropping event from a previous call: {:?}", event);
                    return;
                }
                session.negotiator.handle_peer_event(event).await;
            }
        }
        self.apply(&mut session);
    }

    /// Carry out everything the negotiator asked for.
    fn apply(&self, session: &mut Session) {
        loop {
            let effects = session.negotiator.take_effects();
            if effects.is_empty() {
                break;
            }
            for effect in effects {
                match effect {
                    Effect::Send(signal) => self.transport.send(&signal),
                    Effect::IncomingCall { from } => {
                        self.events.publish(CallEvent::IncomingCall { from })
                    }
                    Effect::RemoteStream(stream) => {
                        self.events.publish(CallEvent::RemoteStream(stream))
                    }
                    Effect::StateChanged(state) => {
                        if state.is_in_call() {
                            self.events.forget(EventKind::IncomingCall);
                        }
                        self.events.publish(CallEvent::StateChanged(state));
                    }
                    Effect::Ended(reason) => {
                        if session.local_media.take().is_some() {
                            tracing::debug!("Released local media");
                        }
                        self.events.forget(EventKind::IncomingCall);
                        self.events.forget(EventKind::RemoteStream);
                        self.events.publish(CallEvent::CallEnded(reason));
                        if session.listening {
                            session.negotiator.listen();
                        } else {
                            self.transport.close();
                        }
                    }
                }
            }
        }
    }

    fn track_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

async fn pump_inputs(shared: Weak<Shared>, mut inputs: mpsc::UnboundedReceiver<Input>) {
    while let Some(input) = inputs.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.process(input).await;
    }
}

async fn forward_signals(
    mut signals: broadcast::Receiver<Signal>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    loop {
        match signals.recv().await {
            Ok(signal) => {
                if inputs.send(Input::Signal(signal)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Signal backlog overflowed, {} signals lost", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
