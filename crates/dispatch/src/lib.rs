//! Point-to-point envelope dispatch between Beach endpoints.
//!
//! Every endpoint registers a [`Receiver`] and gets back a [`Dispatch`] handle
//! for sending. Dispatchers opened under the same id on one connector share a
//! single link. Four backends are available: in-process [`loopback`], the
//! delay-injecting [`jitter`] network, the relay [`socket`] backend, and the
//! relay [`stream`] backend (POST plus server-sent events).

mod dispatcher;
pub mod envelope;
pub mod error;
pub mod jitter;
pub mod loopback;
pub mod receiver;
pub mod registry;
mod session;
pub mod socket;
pub mod stream;

pub use dispatcher::{Connector, Dispatch, Dispatcher};
pub use envelope::{EndpointId, Envelope, Listing, RouteAck, ShutdownNotice};
pub use error::{DispatchError, DispatchResult};
pub use jitter::{JitterConfig, JitterNetwork};
pub use loopback::LoopbackNetwork;
pub use receiver::{ChannelReceiver, Inbound, Receiver};
pub use registry::{Inlet, Link, Registry};
pub use socket::SocketConnector;
pub use stream::StreamConnector;
