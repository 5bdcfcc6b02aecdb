use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use tracing::{debug, warn};

use crate::adapters::http::state::HttpState;
use crate::application::dto::{ClientCommand, ResultView, ServerMessage};
use crate::domain::{errors::DomainResult, stream::LiveEvent};

pub async fn ws_handler(ws: WebSocketUpgrade, State(st): State<HttpState>) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, st))
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            warn!("cannot serialize live message: {err}");
            true
        }
    }
}

fn apply_command(st: &HttpState, command: ClientCommand) -> DomainResult<()> {
    let service = &st.inspection;
    match command {
        ClientCommand::Start { camera, models } => service.start(&camera, models),
        ClientCommand::Stop { camera } => service.stop(&camera),
        ClientCommand::Pause { camera } => service.pause(&camera),
        ClientCommand::Resume { camera } => service.resume(&camera),
        ClientCommand::Trigger { camera } => service.trigger(&camera),
        ClientCommand::Actions { config } => service.apply_actions(config),
    }
}

/// Results go out as a JSON message followed by the JPEG as a binary
/// message; status boards and gap markers are JSON only.
async fn handle_socket(mut socket: WebSocket, st: HttpState) {
    let mut live = st.inspection.subscribe();
    debug!("dashboard connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                let reply = match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => apply_command(&st, command).err().map(|e| e.to_string()),
                    Err(e) => Some(format!("unrecognised command: {e}")),
                };
                if let Some(message) = reply {
                    if !send_json(&mut socket, &ServerMessage::Error { message }).await {
                        break;
                    }
                }
            }
            event = live.next() => {
                let Some(event) = event else { break };
                let delivered = match event {
                    LiveEvent::Result(result) => {
                        let view = ResultView::resolve(&result, st.inspection.registry());
                        let mut sent = send_json(&mut socket, &ServerMessage::Result(view)).await;
                        if let (true, Some(jpeg)) = (sent, &result.image) {
                            sent = socket.send(Message::Binary(jpeg.to_vec())).await.is_ok();
                        }
                        sent
                    }
                    LiveEvent::Status(board) => send_json(&mut socket, &ServerMessage::Status(board)).await,
                    LiveEvent::Gap { missed } => {
                        debug!(missed, "dashboard fell behind");
                        send_json(&mut socket, &ServerMessage::Gap { missed }).await
                    }
                };
                if !delivered {
                    break;
                }
            }
        }
    }
    debug!("dashboard disconnected");
}
