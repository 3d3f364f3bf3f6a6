//! HTTP-level events exchanged between connection handlers and streams.

use std::fmt;

use bytes::Bytes;

use crate::message::{Headers, Request, Response};

/// Identifies one request/response exchange on a connection.
pub type StreamId = u32;

/// Status code meaning "close without sending a response".
pub const NO_RESPONSE: u16 = 444;

/// Why an exchange failed, and what the client should be told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    GenericClientError,
    GenericServerError,
    RequestTooLarge,
    ResponseTooLarge,
    ConnectFailed,
    PassthroughClose,
    Kill,
    Http11Required,
    DestinationUnknown,
    RequestValidationFailed,
    ResponseValidationFailed,
    Cancel,
    ClientDisconnected,
    /// The upstream vanished while the request body was still streaming.
    RequestTimeout,
}

impl ErrorCode {
    /// Status code of the synthetic response, `None` if nothing is sent.
    pub fn http_status_code(&self) -> Option<u16> {
        match self {
            ErrorCode::GenericClientError
            | ErrorCode::DestinationUnknown
            | ErrorCode::RequestValidationFailed => Some(400),
            ErrorCode::RequestTooLarge => Some(413),
            ErrorCode::GenericServerError
            | ErrorCode::ResponseTooLarge
            | ErrorCode::ConnectFailed
            | ErrorCode::ResponseValidationFailed => Some(502),
            ErrorCode::RequestTimeout => Some(408),
            ErrorCode::ClientDisconnected => Some(499),
            ErrorCode::PassthroughClose
            | ErrorCode::Kill
            | ErrorCode::Http11Required
            | ErrorCode::Cancel => None,
        }
    }
}

/// One step of an HTTP exchange, independent of the wire version.
#[derive(Clone)]
pub enum HttpEvent {
    RequestHeaders {
        stream_id: StreamId,
        request: Request,
        end_stream: bool,
    },
    RequestData {
        stream_id: StreamId,
        data: Bytes,
    },
    RequestTrailers {
        stream_id: StreamId,
        trailers: Headers,
    },
    RequestEndOfMessage {
        stream_id: StreamId,
    },
    RequestProtocolError {
        stream_id: StreamId,
        message: String,
        code: ErrorCode,
    },
    ResponseHeaders {
        stream_id: StreamId,
        response: Response,
        end_stream: bool,
    },
    ResponseData {
        stream_id: StreamId,
        data: Bytes,
    },
    ResponseTrailers {
        stream_id: StreamId,
        trailers: Headers,
    },
    ResponseEndOfMessage {
        stream_id: StreamId,
    },
    ResponseProtocolError {
        stream_id: StreamId,
        message: String,
        code: ErrorCode,
    },
}

impl HttpEvent {
    pub fn stream_id(&self) -> StreamId {
        match self {
            HttpEvent::RequestHeaders { stream_id, .. }
            | HttpEvent::RequestData { stream_id, .. }
            | HttpEvent::RequestTrailers { stream_id, .. }
            | HttpEvent::RequestEndOfMessage { stream_id }
            | HttpEvent::RequestProtocolError { stream_id, .. }
            | HttpEvent::ResponseHeaders { stream_id, .. }
            | HttpEvent::ResponseData { stream_id, .. }
            | HttpEvent::ResponseTrailers { stream_id, .. }
            | HttpEvent::ResponseEndOfMessage { stream_id }
            | HttpEvent::ResponseProtocolError { stream_id, .. } => *stream_id,
        }
    }

    pub(crate) fn set_stream_id(&mut self, id: StreamId) {
        match self {
            HttpEvent::RequestHeaders { stream_id, .. }
            | HttpEvent::RequestData { stream_id, .. }
            | HttpEvent::RequestTrailers { stream_id, .. }
            | HttpEvent::RequestEndOfMessage { stream_id }
            | HttpEvent::RequestProtocolError { stream_id, .. }
            | HttpEvent::ResponseHeaders { stream_id, .. }
            | HttpEvent::ResponseData { stream_id, .. }
            | HttpEvent::ResponseTrailers { stream_id, .. }
            | HttpEvent::ResponseEndOfMessage { stream_id }
            | HttpEvent::ResponseProtocolError { stream_id, .. } => *stream_id = id,
        }
    }

    /// True for the client-to-server half of the exchange.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            HttpEvent::RequestHeaders { .. }
                | HttpEvent::RequestData { .. }
                | HttpEvent::RequestTrailers { .. }
                | HttpEvent::RequestEndOfMessage { .. }
                | HttpEvent::RequestProtocolError { .. }
        )
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            HttpEvent::RequestProtocolError { .. } | HttpEvent::ResponseProtocolError { .. }
        )
    }

    fn name(&self) -> &'static str {
        match self {
            HttpEvent::RequestHeaders { .. } => "RequestHeaders",
            HttpEvent::RequestData { .. } => "RequestData",
            HttpEvent::RequestTrailers { .. } => "RequestTrailers",
            HttpEvent::RequestEndOfMessage { .. } => "RequestEndOfMessage",
            HttpEvent::RequestProtocolError { .. } => "RequestProtocolError",
            HttpEvent::ResponseHeaders { .. } => "ResponseHeaders",
            HttpEvent::ResponseData { .. } => "ResponseData",
            HttpEvent::ResponseTrailers { .. } => "ResponseTrailers",
            HttpEvent::ResponseEndOfMessage { .. } => "ResponseEndOfMessage",
            HttpEvent::ResponseProtocolError { .. } => "ResponseProtocolError",
        }
    }
}

impl fmt::Debug for HttpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.name(), self.stream_id())?;
        match self {
            HttpEvent::RequestHeaders { request, .. } => {
                write!(f, ", {} {}", request.method, request.path)?
            }
            HttpEvent::ResponseHeaders { response, .. } => write!(f, ", {}", response.status_code)?,
            HttpEvent::RequestData { data, .. } | HttpEvent::ResponseData { data, .. } => {
                write!(f, ", {} bytes", data.len())?
            }
            HttpEvent::RequestProtocolError { message, code, .. }
            | HttpEvent::ResponseProtocolError { message, code, .. } => {
                write!(f, ", {:?}, {:?}", message, code)?
            }
            _ => {}
        }
        f.write_str(")")
    }
}
