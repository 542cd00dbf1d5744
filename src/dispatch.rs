//! Event dispatcher: the boundary between connections and the engine.
//!
//! One WebSocket route carries the whole wire contract. The identity gate
//! runs before the upgrade; a bad token never becomes a connection. Each
//! socket gets a bounded outbound queue drained by a forwarder task, so the
//! engine only ever hands events off and never waits on a peer.
//!
//! A small HTTP surface covers what the closed command set deliberately does
//! not: creating a match, registering players while it is scheduled, and
//! reading the public snapshot.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::auth::{AuthError, AuthUser};
use crate::error::EngineError;
use crate::events::{ClientCommand, ServerEvent};
use crate::mtch::engine::{self, CreateMatchRequest};
use crate::room::{ConnHandle, ConnId};
use crate::ServerCtx;

pub fn router(ctx: ServerCtx) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/matches", post(create_match))
        .route("/matches/{match_id}", get(get_match))
        .route("/matches/{match_id}/players", post(register_player))
        .with_state(ctx)
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self {
            EngineError::NotFound => StatusCode::NOT_FOUND,
            EngineError::NotHost | EngineError::NotAParticipant => StatusCode::FORBIDDEN,
            EngineError::NotScheduled
            | EngineError::NoPlayers
            | EngineError::MatchNotOngoing
            | EngineError::WrongQuestion
            | EngineError::AlreadyAnswered
            | EngineError::WrongSubState
            | EngineError::Cancelled => StatusCode::CONFLICT,
            EngineError::OptionNotRecognised
            | EngineError::NotEnoughQuestions
            | EngineError::TooManyQuestions => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Busy | EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = json!({ "code": self.code(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

fn auth_failure(err: AuthError) -> Response {
    match err {
        AuthError::InvalidCredential => StatusCode::UNAUTHORIZED.into_response(),
        AuthError::Unavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn bearer_user(ctx: &ServerCtx, headers: &HeaderMap) -> Result<AuthUser, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(token) = token else {
        return Err(StatusCode::UNAUTHORIZED.into_response());
    };

    ctx.identity
        .verify_credential(token)
        .await
        .map_err(auth_failure)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: String,
}

async fn ws_handler(
    State(ctx): State<ServerCtx>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    // Identity gate before the upgrade: a refused credential never becomes a
    // connection.
    let user = match ctx.identity.verify_credential(&params.token).await {
        Ok(user) => user,
        Err(err) => return auth_failure(err),
    };

    ws.on_upgrade(move |socket| handle_socket(ctx, user, socket))
}

async fn handle_socket(ctx: ServerCtx, user: AuthUser, socket: WebSocket) {
    let conn_id = ConnId::generate();
    let (mut sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Arc<ServerEvent>>(ctx.config.broadcast_queue_cap);

    // Outbound forwarder: drains the queue onto the socket. Transmission
    // failures end the forwarder; teardown below detaches the room binding.
    let forwarder = tokio::spawn(async move {
        let mut events = ReceiverStream::new(rx);
        while let Some(event) = events.next().await {
            let Ok(frame) = serde_json::to_string(event.as_ref()) else {
                continue;
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    info!(user_id = %user.user_id, role = %user.role, %conn_id, "connection established");

    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&ctx, &user, conn_id, &tx, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%conn_id, "socket error: {err}");
                        break;
                    }
                }
            }
            () = ctx.shutdown.cancelled() => break,
        }
    }

    ctx.rooms.detach(conn_id);
    forwarder.abort();
    info!(user_id = %user.user_id, %conn_id, "connection closed");
}

async fn handle_frame(
    ctx: &ServerCtx,
    user: &AuthUser,
    conn_id: ConnId,
    tx: &mpsc::Sender<Arc<ServerEvent>>,
    frame: &str,
) {
    let command = match serde_json::from_str::<ClientCommand>(frame) {
        Ok(command) => command,
        Err(err) => {
            debug!(%conn_id, "unparseable command: {err}");
            let _ = tx.try_send(Arc::new(ServerEvent::Error {
                code: "bad_command".to_owned(),
                message: "could not parse command".to_owned(),
            }));
            return;
        }
    };
    debug!(%conn_id, match_id = %command.match_id(), "command received");

    if let Err(err) = dispatch_command(ctx, user, conn_id, tx, command).await {
        let _ = tx.try_send(Arc::new(ServerEvent::error(&err)));
    }
}

async fn dispatch_command(
    ctx: &ServerCtx,
    user: &AuthUser,
    conn_id: ConnId,
    tx: &mpsc::Sender<Arc<ServerEvent>>,
    command: ClientCommand,
) -> Result<(), EngineError> {
    match command {
        ClientCommand::Join { match_id } => {
            let conn = ConnHandle {
                conn_id,
                tx: tx.clone(),
            };
            engine::join(ctx, &match_id, &user.user_id, conn).await?;
            Ok(())
        }
        ClientCommand::Leave { .. } => {
            ctx.rooms.detach(conn_id);
            Ok(())
        }
        ClientCommand::Start { match_id } => engine::start(ctx, &match_id, &user.user_id).await,
        ClientCommand::Advance { match_id } => engine::advance(ctx, &match_id, &user.user_id).await,
        ClientCommand::Delete { match_id } => {
            engine::delete_if_scheduled(ctx, &match_id, &user.user_id).await
        }
        ClientCommand::SubmitAnswer {
            match_id,
            question_number,
            selected_option,
            client_latency_hint_ms: _,
        } => {
            // The private confirmation goes out through the room inside the
            // serialized section, so it can never trail the reveal.
            engine::submit_answer(ctx, &match_id, &user.user_id, question_number, &selected_option)
                .await?;
            Ok(())
        }
    }
}

async fn create_match(
    State(ctx): State<ServerCtx>,
    headers: HeaderMap,
    Json(request): Json<CreateMatchRequest>,
) -> Response {
    let user = match bearer_user(&ctx, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    match engine::create_match(&ctx, &user.user_id, request).await {
        Ok(snapshot) => (StatusCode::CREATED, Json(snapshot)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn register_player(
    State(ctx): State<ServerCtx>,
    Path(match_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let user = match bearer_user(&ctx, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    match engine::register_player(&ctx, &match_id, &user.user_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_match(State(ctx): State<ServerCtx>, Path(match_id): Path<String>) -> Response {
    match engine::get_snapshot(&ctx, &match_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => err.into_response(),
    }
}
