use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tungstenite::Message;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::control::ControlSink;
use crate::signal_message::{candidate_signal, SignalMessage};

type WebSocketReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub type OnRemoteTrackHdlrFn = Box<
    dyn (FnMut(Arc<TrackRemote>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;

fn insecure_verifier() -> Arc<dyn ServerCertVerifier> {
    #[derive(Debug)]
    struct InsecureVerifier;

    impl ServerCertVerifier for InsecureVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::Certificate,
            _intermediates: &[rustls::Certificate],
            _server_name: &rustls::ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: std::time::SystemTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }
    }

    Arc::new(InsecureVerifier)
}

/// Lifecycle of one negotiation session. The remote side always offers; this
/// console only answers.
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum LinkStatus {
    // Transport open, peer connection constructed, nothing exchanged yet
    Idle,
    // Listening for the remote offer
    AwaitingOffer,
    // Remote description applied, local answer generated and sent
    Answering,
    // ICE reported success
    Connected,
    // Terminal: transport or negotiation failure, a fresh session is required
    Failed,
}

#[derive(Error, Debug)]
pub enum TelebotLinkError {
    #[error("Connection attempt failed: `{0}`")]
    ConnectionAttemptFailed(tungstenite::Error),
    #[error("Incorrect state for operation")]
    IncorrectStateForOperation,
    #[error("Failed to add default media codecs")]
    AddDefaultCodecFailed,
    #[error("Failed to add audio track")]
    AddAudioTrackFailed,
    #[error("Failed to add ICE candidate")]
    AddIceCandidateFailed,
    #[error("Failed to create peer connection")]
    PeerConnectionCreationFailed,
    #[error("Failed to set remote description")]
    RemoteDescriptionFailed,
    #[error("Failed to set local description")]
    LocalDescriptionFailed,
    #[error("Failed to send signaling message")]
    FailedToSendMessage,
    #[error("Failed to write audio sample")]
    WriteSampleError,
}

/// One negotiation session per transport connection: the peer connection, the
/// outbound signaling sender and the candidate buffer live here so every
/// handler works against explicit session state.
struct Session {
    pc: Arc<RTCPeerConnection>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    status: Arc<Mutex<LinkStatus>>,
    remote_desc_set: Arc<Mutex<bool>>,
    pending_remote_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
}

impl Session {
    fn new(pc: Arc<RTCPeerConnection>, outbound: mpsc::UnboundedSender<SignalMessage>) -> Self {
        Self {
            pc,
            outbound,
            status: Arc::new(Mutex::new(LinkStatus::Idle)),
            remote_desc_set: Arc::new(Mutex::new(false)),
            pending_remote_candidates: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn status(&self) -> LinkStatus {
        *self.status.lock().await
    }

    async fn fail(&self) {
        *self.status.lock().await = LinkStatus::Failed;
    }

    /// Moves the session forward. Failed is terminal and never overwritten.
    async fn advance(&self, next: LinkStatus) {
        let mut status = self.status.lock().await;
        if *status != LinkStatus::Failed {
            *status = next;
        }
    }

    /// Applies one inbound signaling message. Any error here is a hard failure
    /// of the session; nothing is retried.
    async fn handle_signal(&self, signal: SignalMessage) -> Result<(), TelebotLinkError> {
        match signal {
            SignalMessage::Offer { description } => {
                info!("Processing remote offer");
                self.advance(LinkStatus::Answering).await;

                let offer = RTCSessionDescription::offer(description)
                    .map_err(|_| TelebotLinkError::RemoteDescriptionFailed)?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(|_| TelebotLinkError::RemoteDescriptionFailed)?;
                *self.remote_desc_set.lock().await = true;

                // Flush candidates that arrived before the offer, in arrival order
                let pending: Vec<RTCIceCandidateInit> = self
                    .pending_remote_candidates
                    .lock()
                    .await
                    .drain(..)
                    .collect();
                if !pending.is_empty() {
                    info!("Flushing {} buffered ICE candidates", pending.len());
                }
                for candidate in pending {
                    self.pc
                        .add_ice_candidate(candidate)
                        .await
                        .map_err(|_| TelebotLinkError::AddIceCandidateFailed)?;
                }

                info!("Remote description set, creating answer");
                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(|_| TelebotLinkError::LocalDescriptionFailed)?;
                let description = answer.sdp.clone();
                self.pc
                    .set_local_description(answer)
                    .await
                    .map_err(|_| TelebotLinkError::LocalDescriptionFailed)?;

                self.outbound
                    .send(SignalMessage::Answer { description })
                    .map_err(|_| TelebotLinkError::FailedToSendMessage)?;
                info!("Local description set, answer sent");
                Ok(())
            }
            SignalMessage::Answer { .. } => {
                // Outbound-only shape: this side never offers
                warn!("Ignoring unexpected answer from remote");
                Ok(())
            }
            SignalMessage::Candidate { candidate, mid } => {
                let candidate = RTCIceCandidateInit {
                    candidate,
                    sdp_mid: mid,
                    ..Default::default()
                };
                if *self.remote_desc_set.lock().await {
                    debug!("Adding remote ICE candidate");
                    self.pc
                        .add_ice_candidate(candidate)
                        .await
                        .map_err(|_| TelebotLinkError::AddIceCandidateFailed)
                } else {
                    debug!("Remote description not set yet, buffering ICE candidate");
                    self.pending_remote_candidates.lock().await.push(candidate);
                    Ok(())
                }
            }
        }
    }
}

/// The console's side of the telebot link: signaling transport, negotiation
/// state machine and the peer connection, answering the robot's offer. The
/// data channel the robot opens is handed to the [`ControlSink`].
pub struct TelebotLink {
    signaling_url: String,
    send_audio: bool,
    allow_skip_cert_check: bool,
    sink: ControlSink,

    // Can be added to after link creation
    track_listeners: Arc<Mutex<Vec<OnRemoteTrackHdlrFn>>>,

    // Valid only after try_connect has been called successfully
    session: Arc<Mutex<Option<Arc<Session>>>>,
    audio_track: Arc<Mutex<Option<Arc<TrackLocalStaticSample>>>>,

    // Timing for audio sample duration calculation
    last_sample_time: Arc<Mutex<Option<Instant>>>,
}

impl TelebotLink {
    pub fn new(url: &str, send_audio: bool, allow_skip_cert_check: bool, sink: ControlSink) -> Self {
        Self {
            signaling_url: url.to_string(),
            send_audio,
            allow_skip_cert_check,
            sink,
            track_listeners: Arc::new(Mutex::new(vec![])),
            session: Arc::new(Mutex::new(None)),
            audio_track: Arc::new(Mutex::new(None)),
            last_sample_time: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers a listener for remote media tracks. Video rendering lives
    /// outside this crate; tracks are passed through untouched.
    pub async fn on_remote_track(&mut self, listener: OnRemoteTrackHdlrFn) {
        self.track_listeners.lock().await.push(listener);
    }

    pub async fn status(&self) -> LinkStatus {
        match self.session.lock().await.as_ref() {
            Some(session) => session.status().await,
            None => LinkStatus::Idle,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.status().await == LinkStatus::Connected
    }

    /// Opens the signaling transport, constructs the peer connection and
    /// starts listening for the remote offer. A transport error here or later
    /// is terminal; there is no reconnection.
    pub async fn try_connect(&mut self) -> Result<(), TelebotLinkError> {
        info!(
            "TelebotLink::try_connect: signaling_url={}",
            self.signaling_url
        );

        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();

        if self.allow_skip_cert_check {
            warn!("allow_skip_cert_check=true, using insecure TLS verifier");
            config
                .dangerous()
                .set_certificate_verifier(insecure_verifier());
        }

        let connector = Connector::Rustls(Arc::new(config));

        info!("Connecting WebSocket to {}", self.signaling_url);
        let (ws_stream, _) =
            connect_async_tls_with_config(&self.signaling_url, None, false, Some(connector))
                .await
                .map_err(TelebotLinkError::ConnectionAttemptFailed)?;

        info!("WebSocket connected to signaling server");
        let (mut ws_write, ws_read) = ws_stream.split();

        debug!("Registering default codecs");
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|_| TelebotLinkError::AddDefaultCodecFailed)?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };

        debug!("Creating peer connection");
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|_| TelebotLinkError::PeerConnectionCreationFailed)?,
        );

        if self.send_audio {
            info!("Attaching local audio track");
            let track = add_audio_track(&pc).await?;
            self.audio_track.lock().await.replace(track);
        }

        // Writer task drains outbound signaling messages into the WebSocket,
        // preserving candidate emission order
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
        tokio::spawn(async move {
            while let Some(signal) = outbound_rx.recv().await {
                let encoded = match signal.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode signaling message: {e}");
                        continue;
                    }
                };
                debug!("Sending signaling message: {encoded}");
                if let Err(e) = ws_write.send(Message::Text(encoded)).await {
                    error!("Failed to send signaling message: {e}");
                    break;
                }
            }
        });

        let session = Arc::new(Session::new(Arc::clone(&pc), outbound_tx.clone()));

        // Locally gathered candidates are trickled out as they appear; the
        // end-of-gathering sentinel is swallowed
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let outbound = outbound_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        if let Some(signal) = candidate_signal(init.candidate, init.sdp_mid) {
                            debug!("Sending local ICE candidate");
                            if outbound.send(signal).is_err() {
                                warn!("Outbound signaling channel closed, dropping candidate");
                            }
                        }
                    }
                    Err(e) => error!("Failed to convert ICE candidate to JSON: {e}"),
                }
            })
        }));

        // ICE state is advisory except for failure, which is terminal
        let status_clone = Arc::clone(&session.status);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            info!("ICE connection state changed: {state:?}");
            let status_clone = Arc::clone(&status_clone);
            Box::pin(async move {
                match state {
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        let mut status = status_clone.lock().await;
                        if *status != LinkStatus::Failed {
                            *status = LinkStatus::Connected;
                        }
                    }
                    RTCIceConnectionState::Failed => {
                        error!("Connection failed; telebot link is unrecoverable");
                        *status_clone.lock().await = LinkStatus::Failed;
                    }
                    _ => (),
                }
            })
        }));

        // The robot opens the control channel; hand it to the sink and log
        // whatever comes back (inbound traffic is never parsed)
        let sink = self.sink.clone();
        pc.on_data_channel(Box::new(move |dc| {
            info!("Data channel opened: {}", dc.label());
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                Box::pin(async move {
                    debug!(
                        "Data channel message received: {}",
                        String::from_utf8_lossy(&msg.data)
                    );
                })
            }));
            let sink = sink.clone();
            Box::pin(async move {
                sink.attach(dc).await;
            })
        }));

        let listeners_clone = Arc::clone(&self.track_listeners);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            info!("Remote track received: {}", track.kind());
            let listeners_clone = Arc::clone(&listeners_clone);
            Box::pin(async move {
                for listener in listeners_clone.lock().await.iter_mut() {
                    listener(Arc::clone(&track)).await;
                }
            })
        }));

        // The listen task may see a buffered offer or a transport error the
        // moment it starts, so the session must already be in AwaitingOffer
        session.advance(LinkStatus::AwaitingOffer).await;
        self.listen(ws_read, Arc::clone(&session));
        self.session.lock().await.replace(session);

        info!("TelebotLink::try_connect complete, awaiting remote offer");
        Ok(())
    }

    /// Feeds one captured audio sample to the outbound audio track. Valid only
    /// when the link was created with `send_audio`.
    pub async fn write_audio(&self, sample: Bytes) -> Result<(), TelebotLinkError> {
        if let Some(track) = self.audio_track.lock().await.as_ref() {
            let now = Instant::now();
            let mut last_time_guard = self.last_sample_time.lock().await;
            let duration = match *last_time_guard {
                Some(last_time) => now.duration_since(last_time),
                // Default to a 20 ms frame for the first sample
                None => Duration::from_millis(20),
            };
            *last_time_guard = Some(now);
            drop(last_time_guard);

            track
                .write_sample(&Sample {
                    data: sample,
                    duration,
                    ..Default::default()
                })
                .await
                .map_err(|_| TelebotLinkError::WriteSampleError)?;
            Ok(())
        } else {
            Err(TelebotLinkError::IncorrectStateForOperation)
        }
    }

    fn listen(&self, mut ws_read: WebSocketReader, session: Arc<Session>) {
        info!("Starting signaling listen loop");

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(e) => {
                        error!("Signaling transport failed: {e}; telebot is offline");
                        session.fail().await;
                        return;
                    }
                };
                match msg {
                    Message::Text(text) => {
                        debug!("Signaling frame received: {text}");
                        let Some(signal) = SignalMessage::parse(&text) else {
                            warn!("Dropping unrecognised signaling frame");
                            continue;
                        };
                        if let Err(e) = session.handle_signal(signal).await {
                            error!("Negotiation failed: {e}");
                            session.fail().await;
                            return;
                        }
                    }
                    other => {
                        debug!("Ignoring non-text signaling frame: {other:?}");
                    }
                }
            }

            info!("Signaling connection closed");
        });
    }
}

async fn add_audio_track(
    pc: &RTCPeerConnection,
) -> Result<Arc<TrackLocalStaticSample>, TelebotLinkError> {
    let codec = RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        ..Default::default()
    };

    let track = Arc::new(TrackLocalStaticSample::new(
        codec,
        "audio".to_owned(),
        "console".to_owned(),
    ));
    pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|_| TelebotLinkError::AddAudioTrackFailed)?;

    Ok(track)
}
