//! One signaling connection: a read loop on the caller's task and a write
//! loop on its own task

use super::{SignalingHub, SignalingSettings};
use crate::state::AppState;
use crate::transport::MediaTransport;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use bytes::Bytes;
use fanout_protocol::ClientEvent;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub async fn ws_handler<T: MediaTransport>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<T>>,
) -> Response {
    let hub = state.signaling.clone();
    let settings = state.signaling_settings.clone();

    ws.max_message_size(settings.max_message_size)
        .on_upgrade(move |socket| serve(socket, hub, settings))
}

/// Run a signaling session on an upgraded socket until either side stops
pub async fn serve(socket: WebSocket, hub: Arc<SignalingHub>, settings: SignalingSettings) {
    let (sink, stream) = socket.split();
    run_session(sink, stream, hub, settings).await;
}

async fn run_session<Si, St, E>(
    sink: Si,
    stream: St,
    hub: Arc<SignalingHub>,
    settings: SignalingSettings,
) where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (sender, queue) = mpsc::channel(settings.send_queue_capacity.max(1));
    let id = hub.register(sender).await;
    tracing::info!("Signaling client {} connected", id);

    let mut writer = tokio::spawn(write_loop(sink, queue, settings.clone()));

    let writer_done = tokio::select! {
        _ = read_loop(stream, &hub, &id, settings.pong_wait) => false,
        _ = &mut writer => true,
    };

    // Drops the hub's sender, which ends the writer once the queue drains
    hub.unregister(&id).await;

    if !writer_done && tokio::time::timeout(settings.write_wait, &mut writer).await.is_err() {
        writer.abort();
    }

    tracing::info!("Signaling client {} disconnected", id);
}

/// Decode and dispatch inbound frames. Stops on close, on a read error, or
/// when nothing arrives within `pong_wait`.
async fn read_loop<St, E>(mut stream: St, hub: &SignalingHub, id: &str, pong_wait: Duration)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let message = match tokio::time::timeout(pong_wait, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                tracing::debug!("WebSocket error for {}: {}", id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::info!("Client {} silent for {:?}, closing", id, pong_wait);
                break;
            }
        };

        match message {
            Message::Text(text) => match ClientEvent::parse(text.as_str()) {
                Ok(Some(event)) => hub.handle(id, event).await,
                Ok(None) => tracing::debug!("Ignoring unhandled event from {}", id),
                Err(e) => tracing::warn!("Invalid message from {}: {}", id, e),
            },
            Message::Close(_) => break,
            // Pongs and anything else only reset the read deadline
            _ => {}
        }
    }
}

/// The only writer of the socket: queued messages, pings and the final
/// close frame all go out from here
async fn write_loop<Si>(mut sink: Si, mut queue: mpsc::Receiver<String>, settings: SignalingSettings)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let period = settings.ping_period();
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        let frame = tokio::select! {
            message = queue.recv() => match message {
                Some(first) => Message::Text(coalesce(first, &mut queue).into()),
                None => {
                    let _ = tokio::time::timeout(settings.write_wait, sink.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match tokio::time::timeout(settings.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("WebSocket write failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::info!("WebSocket write timed out after {:?}", settings.write_wait);
                break;
            }
        }
    }
}

/// Join everything already queued behind `first` into one newline separated
/// frame
fn coalesce(first: String, queue: &mut mpsc::Receiver<String>) -> String {
    let mut frame = first;
    while let Ok(next) = queue.try_recv() {
        frame.push('\n');
        frame.push_str(&next);
    }
    frame
}
