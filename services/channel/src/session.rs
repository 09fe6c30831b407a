//! One WebSocket session: upgrade, admission check, then the receive/deliver
//! loop that ties an inbound envelope stream to the client's hub mailbox.
//!
//! Built around a timeout-raced read loop, generalised from one
//! hardware-specific message type to the channel envelope protocol and
//! from a database-backed registry to the in-process [`crate::hub::Hub`].

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tangram_admission::{TokenClaims, extract_bearer};
use tangram_bus::Bus;
use tangram_protocol::{Envelope, ReplyStatus, control_event};
use tracing::{info, warn};

use crate::hub::AppState;

const HEARTBEAT_WINDOW: Duration = Duration::from_secs(60);

pub async fn channel_socket_handler<B: Bus + Clone + Send + Sync + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<B>>,
    headers: HeaderMap,
) -> Response {
    let token = match headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
    {
        Some(t) => t.to_owned(),
        None => return (StatusCode::UNAUTHORIZED, "missing Authorization header").into_response(),
    };

    let now = chrono::Utc::now().timestamp() as f64;
    let claims = match state.admission.verify(&token, now) {
        Ok(claims) => claims,
        Err(error) => {
            return (StatusCode::UNAUTHORIZED, error.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

async fn handle_socket<B: Bus + Clone + Send + Sync + 'static>(
    mut socket: WebSocket,
    state: AppState<B>,
    claims: TokenClaims,
) {
    let client_id = claims.subject.clone();
    let mailbox = state.hub.register_client(&client_id).await;
    info!(client_id = %client_id, "channel session opened");

    loop {
        tokio::select! {
            biased;

            inbound = tokio::time::timeout(HEARTBEAT_WINDOW, socket.recv()) => {
                match inbound {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        let envelope: Envelope = match serde_json::from_str(&text) {
                            Ok(envelope) => envelope,
                            Err(error) => {
                                warn!(client_id = %client_id, %error, "malformed envelope, closing session");
                                break;
                            }
                        };
                        if let Some(reply) = dispatch_inbound(&state, &claims, &client_id, envelope).await {
                            if send_envelope(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        info!(client_id = %client_id, "channel session closed by client");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(error))) => {
                        warn!(client_id = %client_id, %error, "transport error, closing session");
                        break;
                    }
                    Err(_) => {
                        warn!(client_id = %client_id, "heartbeat window elapsed, closing session");
                        break;
                    }
                }
            }

            envelope = mailbox.recv() => {
                if send_envelope(&mut socket, &envelope).await.is_err() {
                    break;
                }
                if mailbox.is_stale() {
                    warn!(client_id = %client_id, "mailbox overflowed, closing session");
                    break;
                }
            }
        }
    }

    state.hub.drop_client(&client_id).await;
    info!(client_id = %client_id, "channel session ended");
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), axum::Error> {
    let json = serde_json::to_string(envelope).expect("Envelope serialization cannot fail");
    socket.send(Message::Text(json.into())).await
}

/// Handles one inbound envelope and returns the `phx_reply` to send back, if
/// the envelope carried a correlation `ref`.
async fn dispatch_inbound<B: Bus + Clone + Send + Sync + 'static>(
    state: &AppState<B>,
    claims: &TokenClaims,
    client_id: &str,
    envelope: Envelope,
) -> Option<Envelope> {
    let wants_reply = envelope.msg_ref.is_some();

    match envelope.event.as_str() {
        control_event::HEARTBEAT => {
            wants_reply.then(|| envelope.reply(ReplyStatus::Ok, serde_json::json!({})))
        }
        control_event::JOIN => {
            if !claims.authorizes(&envelope.topic) {
                return wants_reply.then(|| {
                    envelope.reply(
                        ReplyStatus::Error,
                        serde_json::json!({"reason": tangram_protocol::error_codes::UNAUTHORIZED}),
                    )
                });
            }
            state.hub.join(client_id, &envelope.topic).await;
            state.hub.ensure_bridge(state.bus.clone(), &envelope.topic).await;
            wants_reply.then(|| envelope.reply(ReplyStatus::Ok, serde_json::json!({})))
        }
        control_event::LEAVE => {
            state.hub.leave(client_id, &envelope.topic).await;
            wants_reply.then(|| envelope.reply(ReplyStatus::Ok, serde_json::json!({})))
        }
        event => {
            let bus_key = format!("{}:{}", envelope.topic, event);
            let payload = serde_json::to_string(&envelope).expect("Envelope serialization cannot fail");
            match state.bus.publish(&bus_key, &payload).await {
                Ok(()) => wants_reply.then(|| envelope.reply(ReplyStatus::Ok, serde_json::json!({}))),
                Err(error) => wants_reply.then(|| {
                    envelope.reply(
                        ReplyStatus::Error,
                        serde_json::json!({"reason": tangram_protocol::error_codes::INTERNAL_ERROR, "detail": error.to_string()}),
                    )
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangram_admission::TopicScope;
    use tangram_bus::InMemoryBus;
    use tangram_config::ChannelConfig;

    fn test_state() -> AppState<InMemoryBus> {
        AppState::new(
            InMemoryBus::new(),
            tangram_admission::Admission::new("shh", 3600),
            ChannelConfig {
                host: "127.0.0.1".to_owned(),
                port: 0,
                public_url: None,
                jwt_secret: "shh".to_owned(),
                jwt_expiration_secs: 3600,
                id_length: 8,
            },
        )
    }

    fn test_claims(scope: TopicScope) -> TokenClaims {
        TokenClaims {
            subject: "client-1".to_owned(),
            scope,
            issued_at: 0.0,
            expires_at: 3600.0,
        }
    }

    #[tokio::test]
    async fn join_with_authorized_scope_records_membership() {
        let state = test_state();
        let claims = test_claims(TopicScope::Exact("coordinate".to_owned()));
        let envelope = Envelope {
            join_ref: Some("1".to_owned()),
            msg_ref: Some("1".to_owned()),
            topic: "coordinate".to_owned(),
            event: control_event::JOIN.to_owned(),
            payload: serde_json::json!({}),
        };
        let reply = dispatch_inbound(&state, &claims, "client-1", envelope).await.unwrap();
        assert_eq!(reply.payload["status"], "ok");
        assert_eq!(state.hub.members("coordinate").await, vec!["client-1".to_owned()]);
    }

    #[tokio::test]
    async fn join_outside_scope_is_rejected_and_not_recorded() {
        let state = test_state();
        let claims = test_claims(TopicScope::Exact("coordinate".to_owned()));
        let envelope = Envelope {
            join_ref: Some("1".to_owned()),
            msg_ref: Some("1".to_owned()),
            topic: "altitude".to_owned(),
            event: control_event::JOIN.to_owned(),
            payload: serde_json::json!({}),
        };
        let reply = dispatch_inbound(&state, &claims, "client-1", envelope).await.unwrap();
        assert_eq!(reply.payload["status"], "error");
        assert!(state.hub.members("altitude").await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_with_ref_is_acknowledged() {
        let state = test_state();
        let claims = test_claims(TopicScope::Any);
        let envelope = Envelope {
            join_ref: None,
            msg_ref: Some("5".to_owned()),
            topic: tangram_protocol::HEARTBEAT_TOPIC.to_owned(),
            event: control_event::HEARTBEAT.to_owned(),
            payload: serde_json::Value::Null,
        };
        let reply = dispatch_inbound(&state, &claims, "client-1", envelope).await.unwrap();
        assert_eq!(reply.event, control_event::REPLY);
        assert_eq!(reply.payload["status"], "ok");
    }

    #[tokio::test]
    async fn application_event_without_ref_gets_no_reply_but_is_published() {
        let state = test_state();
        let claims = test_claims(TopicScope::Any);
        let mut subscription = state.bus.subscribe(&["channel:streaming:ping".to_owned()]).await.unwrap();
        let envelope = Envelope {
            join_ref: None,
            msg_ref: None,
            topic: "channel:streaming".to_owned(),
            event: "ping".to_owned(),
            payload: serde_json::json!({"n": 1}),
        };
        let reply = dispatch_inbound(&state, &claims, "client-1", envelope).await;
        assert!(reply.is_none());
        let published = subscription.recv().await.unwrap();
        assert!(published.payload.contains("\"ping\""));
    }
}
