//! Framed JSON-RPC 2.0 transport.
//!
//! Both the supervisor and the extension runners use the same peer type:
//! either side may originate requests, register incoming methods, cancel
//! in-flight requests via `$/cancelRequest`, and stream `$/progress`
//! notifications. Frames are `Content-Length`-prefixed JSON over any
//! `AsyncRead`/`AsyncWrite` pair (loopback TCP between supervisor and
//! runner, stdio between IDE and supervisor).

mod cancel;
mod codec;
mod error;
mod message;
mod peer;

pub mod methods;

pub use cancel::CancelToken;
pub use codec::{FrameError, FrameReader, FrameWriter};
pub use error::{ErrorObject, RpcError, error_codes};
pub use message::{IncomingMessage, Notification, Request, RequestId, Response, parse_message};
pub use peer::{FeatureReply, PeerBuilder, PeerHandle, feature_fn, notification_fn};
