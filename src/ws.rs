use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use warp::ws::{Message, WebSocket};

use crate::auth::Identity;
use crate::connection::{Frame, TransportReader, TransportWriter};
use crate::error::TransportError;
use crate::server::Server;
use crate::session::Session;

pub struct WsReader(SplitStream<WebSocket>);

pub struct WsWriter(SplitSink<WebSocket, Message>);

pub fn split(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader(stream), WsWriter(sink))
}

#[async_trait]
impl TransportReader for WsReader {
    async fn read_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let message = match self.0.next().await? {
            Ok(message) => message,
            Err(err) => return Some(Err(TransportError::Read(err.to_string()))),
        };

        let frame = if message.is_close() {
            Frame::Close
        } else if message.is_text() {
            match message.to_str() {
                Ok(text) => Frame::Text(text.to_string()),
                Err(()) => Frame::Control,
            }
        } else if message.is_binary() {
            Frame::Binary(message.into_bytes())
        } else {
            Frame::Control
        };
        Some(Ok(frame))
    }
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn write_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Message::text(text))
            .await
            .map_err(|err| TransportError::Write(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0
            .close()
            .await
            .map_err(|err| TransportError::Write(err.to_string()))
    }
}

/// Drives an upgraded socket until it closes.
pub async fn serve(server: Server, session: Session, identity: Identity, socket: WebSocket) {
    let room_id = session.room_id();
    let (reader, writer) = split(socket);
    let exit = server
        .handle_connection(session, identity, reader, writer)
        .await;
    debug!("Socket for room {} finished: {:?}", room_id, exit);
}
