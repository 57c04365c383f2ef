//! WebSocket implementation of the frame transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use omni_agent_core::{
    ClientFrame, FrameSink, Transport, TransportCode, TransportFailure,
    codec::{self, WireMessage},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maps a tungstenite error onto a transport failure.
pub fn map_ws_error(error: tungstenite::Error) -> TransportFailure {
    use tungstenite::Error;
    match error {
        Error::Http(response) => {
            let status = response.status();
            TransportFailure::new(
                TransportCode::from_http_status(status.as_u16()),
                format!("handshake rejected with status {status}"),
            )
        }
        Error::ConnectionClosed | Error::AlreadyClosed => {
            TransportFailure::new(TransportCode::Unavailable, "connection closed")
        }
        Error::Io(e) => TransportFailure::new(TransportCode::Unavailable, e.to_string()),
        Error::Url(e) => {
            TransportFailure::new(TransportCode::InvalidArgument, e.to_string()).with_param("target")
        }
        other => TransportFailure::new(TransportCode::Other("websocket".into()), other.to_string()),
    }
}

/// Opens a WebSocket to `url` and splits it into a frame transport.
pub async fn connect(url: &str) -> Result<Transport, TransportFailure> {
    let request = url.into_client_request().map_err(map_ws_error)?;
    let (ws_stream, _) = connect_async(request).await.map_err(map_ws_error)?;
    info!(%url, "Connected to streaming endpoint.");

    let (write, read) = ws_stream.split();
    let source = read
        .filter_map(|message| async move { decode(message) })
        .boxed();
    Ok(Transport::new(WsFrameSink { write }, source))
}

fn decode(
    message: Result<WsMessage, tungstenite::Error>,
) -> Option<Result<omni_agent_core::ServerFrame, TransportFailure>> {
    let wire = match message {
        Ok(WsMessage::Text(text)) => WireMessage::Text(text.to_string()),
        Ok(WsMessage::Binary(data)) => WireMessage::Binary(data),
        Ok(WsMessage::Close(Some(frame))) => {
            let code = u16::from(frame.code);
            debug!(code, reason = %frame.reason, "Server closed the connection");
            if code == 1000 {
                return None;
            }
            return Some(Err(TransportFailure::new(
                TransportCode::from_ws_close(code),
                frame.reason.to_string(),
            )));
        }
        Ok(_) => return None,
        Err(e) => return Some(Err(map_ws_error(e))),
    };
    Some(codec::decode_server(wire).map_err(|e| {
        TransportFailure::new(TransportCode::Internal, format!("undecodable frame: {e}"))
    }))
}

struct WsFrameSink {
    write: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportFailure> {
        let message = match codec::encode_client(&frame).map_err(|e| {
            TransportFailure::new(TransportCode::InvalidArgument, e.to_string())
        })? {
            WireMessage::Text(text) => WsMessage::Text(text.into()),
            WireMessage::Binary(data) => WsMessage::Binary(data),
        };
        self.write.send(message).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportFailure> {
        match self.write.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(map_ws_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};

    #[test]
    fn test_text_messages_decode_to_server_frames() {
        let decoded = decode(Ok(WsMessage::Text(
            r#"{"type":"llm_delta","text":"你好"}"#.into(),
        )));
        assert_eq!(
            decoded,
            Some(Ok(omni_agent_core::ServerFrame::LlmDelta {
                text: "你好".into()
            }))
        );
    }

    #[test]
    fn test_abnormal_close_is_a_failure() {
        let decoded = decode(Ok(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Again,
            reason: "overloaded".into(),
        }))));
        match decoded {
            Some(Err(failure)) => assert_eq!(failure.code, TransportCode::Unavailable),
            other => panic!("expected failure, got {other:?}"),
        }

        let normal = decode(Ok(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }))));
        assert!(normal.is_none());
    }

    #[test]
    fn test_garbage_is_an_internal_failure() {
        let decoded = decode(Ok(WsMessage::Text("not json".into())));
        assert!(matches!(decoded, Some(Err(f)) if f.code == TransportCode::Internal));
        assert!(decode(Ok(WsMessage::Pong(Default::default()))).is_none());
    }

    #[test]
    fn test_io_errors_are_unavailable() {
        let failure = map_ws_error(tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert_eq!(failure.code, TransportCode::Unavailable);
    }
}
