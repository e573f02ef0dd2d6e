use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    sink::SinkExt,
    stream::{Stream, StreamExt},
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::protocol::{ClientEvent, ServerEvent};
use crate::relay::RelayEngine;
use crate::vehicle_position::ConnectionId;
use crate::web::AppState;

/// Upgrade to the live vehicle socket
pub async fn live_vehicles_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let max_frame_bytes = state.config.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: AppState) {
    let relay = state.relay.clone();
    let (connection_id, fanout_rx) = relay.connect().await;
    info!(%connection_id, "New WebSocket connection established for live vehicles");

    // Split the socket for concurrent read/write
    let (sender, receiver) = socket.split();

    // Direct replies to this connection (acks, errors, query results).
    // Bounded so a client that never reads stops having its frames read.
    let (reply_tx, reply_rx) = mpsc::channel::<ServerEvent>(state.config.reply_queue_capacity.max(1));
    if reply_tx
        .try_send(ServerEvent::Connected { connection_id })
        .is_err()
    {
        warn!(%connection_id, "Failed to queue connected event");
    }

    let idle_timeout = state.config.idle_timeout();
    let heartbeat_interval = state.config.heartbeat_interval();

    let read_relay = relay.clone();
    let mut read_task = tokio::spawn(async move {
        handle_websocket_read(receiver, read_relay, connection_id, reply_tx, idle_timeout).await;
    });

    let mut write_task = tokio::spawn(async move {
        handle_websocket_write(
            sender,
            reply_rx,
            fanout_rx,
            connection_id,
            heartbeat_interval,
        )
        .await;
    });

    // Whichever side finishes first ends the connection
    tokio::select! {
        _ = &mut read_task => {
            debug!(%connection_id, "WebSocket read task completed");
            write_task.abort();
        }
        _ = &mut write_task => {
            debug!(%connection_id, "WebSocket write task completed");
            read_task.abort();
        }
    }

    relay.disconnect(connection_id).await;
    info!(%connection_id, "WebSocket connection terminated");
}

async fn handle_websocket_read<S>(
    mut receiver: S,
    relay: RelayEngine,
    connection_id: ConnectionId,
    reply_tx: mpsc::Sender<ServerEvent>,
    idle_timeout: Duration,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        // Any inbound frame, pongs included, counts as activity
        let msg = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => {
                warn!(
                    %connection_id,
                    "No activity for {}s, dropping connection",
                    idle_timeout.as_secs()
                );
                metrics::counter!("relay.connections.idle_timeout_total").increment(1);
                break;
            }
        };

        match msg {
            Ok(Message::Text(text)) => {
                let reply = match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => relay.handle_event(connection_id, event).await,
                    Err(e) => {
                        info!(%connection_id, "Failed to parse client event: {}", e);
                        ServerEvent::error(None, format!("invalid frame: {e}"))
                    }
                };
                // waits while the writer is behind, but not forever
                match tokio::time::timeout(idle_timeout, reply_tx.send(reply)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        error!(%connection_id, "Failed to queue reply for WebSocket writer");
                        break;
                    }
                    Err(_) => {
                        warn!(
                            %connection_id,
                            "Client has not read its replies for {}s, dropping connection",
                            idle_timeout.as_secs()
                        );
                        metrics::counter!("relay.connections.idle_timeout_total").increment(1);
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                info!(%connection_id, "WebSocket connection closed by client");
                break;
            }
            Ok(_) => {
                // Binary, ping and pong frames carry no relay events
            }
            Err(e) => {
                info!(%connection_id, "WebSocket error: {}", e);
                break;
            }
        }
    }
}

async fn handle_websocket_write(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut reply_rx: mpsc::Receiver<ServerEvent>,
    mut fanout_rx: broadcast::Receiver<ServerEvent>,
    connection_id: ConnectionId,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    heartbeat.tick().await;

    loop {
        let event = tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(event) => event,
                None => break,
            },
            fanned = fanout_rx.recv() => match fanned {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%connection_id, "Client lagged, skipped {} events", skipped);
                    metrics::counter!("relay.fanout.lagged_total").increment(skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => {
                if let Err(e) = sender.send(Message::Ping(Bytes::new())).await {
                    debug!(%connection_id, "Failed to send heartbeat: {}", e);
                    break;
                }
                continue;
            }
        };

        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.name(), e);
                continue;
            }
        };

        if let Err(e) = sender.send(Message::Text(json.into())).await {
            debug!(%connection_id, "Failed to send to WebSocket client: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_frames(count: usize) -> Vec<Result<Message, axum::Error>> {
        (0..count)
            .map(|_| Ok(Message::Text(r#"{"event":"query-active-vehicles"}"#.into())))
            .collect()
    }

    #[tokio::test]
    async fn test_reader_stops_while_replies_are_unread() {
        let relay = RelayEngine::new(16);
        let (connection_id, _fanout_rx) = relay.connect().await;
        let (reply_tx, mut reply_rx) = mpsc::channel(2);

        let reader = tokio::spawn(handle_websocket_read(
            futures_util::stream::iter(query_frames(10)),
            relay,
            connection_id,
            reply_tx,
            Duration::from_secs(60),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_finished());
        assert_eq!(reply_rx.len(), 2);

        let mut replies = 0;
        while let Some(reply) = reply_rx.recv().await {
            assert_eq!(reply.name(), "active-vehicles-list");
            replies += 1;
        }
        assert_eq!(replies, 10);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_gives_up_on_stalled_writer() {
        let relay = RelayEngine::new(16);
        let (connection_id, _fanout_rx) = relay.connect().await;
        let (reply_tx, _reply_rx) = mpsc::channel(1);

        let reader = tokio::spawn(handle_websocket_read(
            futures_util::stream::iter(query_frames(3)),
            relay,
            connection_id,
            reply_tx,
            Duration::from_millis(200),
        ));

        tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader should stop once replies back up")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reader_replies_to_malformed_frame() {
        let relay = RelayEngine::new(16);
        let (connection_id, _fanout_rx) = relay.connect().await;
        let (reply_tx, mut reply_rx) = mpsc::channel(4);

        let frames = vec![
            Ok(Message::Binary(Bytes::from_static(b"ignored"))),
            Ok(Message::Text("{not json".into())),
        ];
        handle_websocket_read(
            futures_util::stream::iter(frames),
            relay,
            connection_id,
            reply_tx,
            Duration::from_secs(60),
        )
        .await;

        match reply_rx.recv().await {
            Some(ServerEvent::Error { event: None, reason }) => {
                assert!(reason.starts_with("invalid frame"), "unexpected reason {reason}");
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(reply_rx.recv().await.is_none());
    }
}
