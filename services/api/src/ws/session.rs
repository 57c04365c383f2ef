//! Manages the WebSocket connection lifecycle for one streaming exchange.

use super::{buffer::AudioBuffer, pipeline};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use omni_agent_core::{
    ClientFrame, ControlCommand, ServerFrame, StartFrame, TransportCode,
    codec::{self, CodecError, WireMessage},
};
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{Instrument, debug, error, info, instrument, warn};

pub(crate) type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

enum Inbound {
    Frame(Result<ClientFrame, CodecError>),
    Closed,
    Ignored,
}

fn decode(message: Message) -> Inbound {
    let wire = match message {
        Message::Text(text) => WireMessage::Text(text.to_string()),
        Message::Binary(data) => WireMessage::Binary(data),
        Message::Close(_) => return Inbound::Closed,
        Message::Ping(_) | Message::Pong(_) => return Inbound::Ignored,
    };
    Inbound::Frame(codec::decode_client(wire))
}

fn invalid_argument(message: impl Into<String>) -> ServerFrame {
    ServerFrame::error(TransportCode::InvalidArgument.as_str(), message)
}

/// Main handler for an individual streaming connection.
///
/// The first frame must be a valid start frame naming a live session. The
/// connection is answered with `ready` and then driven by [`run_exchange`]
/// until a terminal frame has been sent or the client goes away.
#[instrument(name = "ws_stream", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New streaming connection. Awaiting start frame...");

    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx: SharedSink = Arc::new(Mutex::new(socket_tx));

    let start = match read_start(&mut socket_rx, &state).await {
        Ok(Some(start)) => start,
        Ok(None) => {
            info!("Client disconnected before sending start frame.");
            return;
        }
        Err(frame) => {
            warn!(?frame, "Rejecting stream.");
            if let Err(e) = send_frame(&socket_tx, &frame).await {
                error!(error = ?e, "Failed to send rejection to client.");
            }
            close_socket(&socket_tx).await;
            return;
        }
    };

    tracing::Span::current().record("session_id", start.session_id.as_str());
    info!(
        inputs = start.initial_inputs.len(),
        history = start.history.len(),
        "Stream started"
    );

    let ready = ServerFrame::Ready {
        session_id: start.session_id.clone(),
    };
    if send_frame(&socket_tx, &ready).await.is_err() {
        error!("Failed to send ready frame to client.");
        return;
    }

    if let Err(e) = run_exchange(state, socket_tx.clone(), socket_rx, start).await {
        error!(error = ?e, "Streaming exchange terminated with error.");
    }
    close_socket(&socket_tx).await;
    info!("Streaming connection closed.");
}

/// Waits for the start frame. `Err` carries the error frame to answer with.
async fn read_start(
    socket_rx: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<Option<StartFrame>, ServerFrame> {
    loop {
        let message = match socket_rx.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(error = ?e, "Error receiving from client WebSocket.");
                return Ok(None);
            }
            None => return Ok(None),
        };
        let frame = match decode(message) {
            Inbound::Ignored => continue,
            Inbound::Closed => return Ok(None),
            Inbound::Frame(Err(e)) => {
                return Err(invalid_argument(format!("undecodable frame: {e}")));
            }
            Inbound::Frame(Ok(frame)) => frame,
        };

        let start = match frame {
            ClientFrame::Start(start) => start,
            other => {
                return Err(invalid_argument(format!(
                    "first frame must be start, got {}",
                    other.kind()
                )));
            }
        };
        start
            .validate()
            .map_err(|e| invalid_argument(e.to_string()).with_param(e.param()))?;
        if state.sessions.get(&start.session_id).await.is_none() {
            return Err(ServerFrame::error(
                TransportCode::NotFound.as_str(),
                format!("Session with ID '{}' not found", start.session_id),
            ));
        }
        return Ok(Some(start));
    }
}

/// The event loop for one started exchange.
///
/// Audio is buffered until end-of-audio, when the reply pipeline is spawned.
/// A flush runs recognition over the audio so far in its own task. Cancel, a
/// close frame, the deadline, or a dropped connection abort whatever is running.
async fn run_exchange(
    state: Arc<AppState>,
    socket_tx: SharedSink,
    mut socket_rx: SplitStream<WebSocket>,
    start: StartFrame,
) -> Result<()> {
    let start = Arc::new(start);
    let deadline = tokio::time::sleep(state.config.stream_deadline);
    tokio::pin!(deadline);

    let mut audio = AudioBuffer::new(state.config.max_audio_bytes);
    let mut partial: Option<JoinHandle<Result<String>>> = None;
    let mut responder: Option<JoinHandle<Result<()>>> = None;

    let outcome = loop {
        tokio::select! {
            biased;

            joined = join(&mut responder) => {
                responder = None;
                joined.map_err(|e| anyhow!("reply pipeline panicked: {e}"))??;
                info!("Exchange complete.");
                break Ok(());
            }
            _ = &mut deadline => {
                warn!(deadline = ?state.config.stream_deadline, "Stream deadline exceeded.");
                abort_all(&mut partial, &mut responder);
                let frame = ServerFrame::error(
                    TransportCode::DeadlineExceeded.as_str(),
                    "stream deadline exceeded",
                );
                break send_frame(&socket_tx, &frame).await;
            }
            joined = join(&mut partial) => {
                partial = None;
                match joined.map_err(|e| anyhow!("partial recognition panicked: {e}"))? {
                    Ok(text) => {
                        let frame = ServerFrame::SttPartial { text, is_final: false };
                        send_frame(&socket_tx, &frame).await?;
                    }
                    Err(e) => {
                        warn!(error = ?e, "Partial recognition failed.");
                        let frame = ServerFrame::error(
                            TransportCode::Unavailable.as_str(),
                            format!("Speech recognition failed: {e}"),
                        );
                        break send_frame(&socket_tx, &frame).await;
                    }
                }
            }
            message = socket_rx.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(error = ?e, "Error receiving from client WebSocket.");
                        break Ok(());
                    }
                    None => {
                        info!("Client disconnected mid-exchange.");
                        break Ok(());
                    }
                };
                let frame = match decode(message) {
                    Inbound::Ignored => continue,
                    Inbound::Closed => {
                        info!("Client sent close frame.");
                        break Ok(());
                    }
                    Inbound::Frame(Err(e)) => {
                        warn!(error = %e, "Undecodable frame from client.");
                        abort_all(&mut partial, &mut responder);
                        break send_frame(&socket_tx, &invalid_argument(format!("undecodable frame: {e}"))).await;
                    }
                    Inbound::Frame(Ok(frame)) => frame,
                };

                let kind = frame.kind();
                match frame {
                    ClientFrame::Control { command: ControlCommand::Cancel } => {
                        info!("Exchange cancelled by client.");
                        break Ok(());
                    }
                    _ if responder.is_some() => {
                        warn!(frame = %kind, "Ignoring frame after end of audio.");
                    }
                    ClientFrame::Start(_) => warn!("Ignoring duplicate start frame."),
                    ClientFrame::Audio { data } => {
                        if let Err(e) = audio.push(&data) {
                            warn!(buffered = audio.len(), chunk = data.len(), "Audio cap reached.");
                            abort(&mut partial, "partial recognition");
                            let frame = invalid_argument(e.to_string()).with_param("audio");
                            break send_frame(&socket_tx, &frame).await;
                        }
                    }
                    ClientFrame::Control { command: ControlCommand::Flush } => {
                        if partial.is_some() {
                            debug!("Partial recognition already running; flush ignored.");
                            continue;
                        }
                        let snapshot = audio.snapshot();
                        let recognizer = state.recognizer.clone();
                        let exchange = start.clone();
                        let task = async move {
                            recognizer.transcribe(snapshot, &exchange.config).await
                        };
                        partial = Some(tokio::spawn(task.in_current_span()));
                    }
                    ClientFrame::Control { command: ControlCommand::EndAudio } => {
                        // The final transcript supersedes any partial still running.
                        abort(&mut partial, "partial recognition");
                        info!(bytes = audio.len(), "End of audio. Generating reply...");
                        let task = pipeline::respond(
                            state.clone(),
                            start.clone(),
                            audio.take(),
                            socket_tx.clone(),
                        );
                        responder = Some(tokio::spawn(task.in_current_span()));
                    }
                }
            }
        }
    };

    abort_all(&mut partial, &mut responder);
    outcome
}

async fn join<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, tokio::task::JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn abort<T>(task: &mut Option<JoinHandle<T>>, name: &str) {
    if let Some(handle) = task.take() {
        handle.abort();
        info!(task = name, "Aborted running task.");
    }
}

fn abort_all(
    partial: &mut Option<JoinHandle<Result<String>>>,
    responder: &mut Option<JoinHandle<Result<()>>>,
) {
    abort(partial, "partial recognition");
    abort(responder, "reply pipeline");
}

async fn close_socket(socket_tx: &SharedSink) {
    if let Err(e) = socket_tx.lock().await.close().await {
        warn!(error = ?e, "Failed to close WebSocket cleanly.");
    }
}

/// Serializes and sends one server frame.
pub(crate) async fn send_frame(socket_tx: &SharedSink, frame: &ServerFrame) -> Result<()> {
    let serialized = codec::encode_server(frame)?;
    socket_tx
        .lock()
        .await
        .send(Message::Text(serialized.into()))
        .await?;
    Ok(())
}
