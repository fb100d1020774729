//! Endpoint resolution and dialing for CSI gRPC endpoints.
//!
//! Endpoints are written as `unix://<path>`, `tcp://<host>:<port>` or a bare
//! `<host>:<port>`. Unix-domain endpoints are local and trusted, so
//! [`choose_dial_opts`] switches them to the custom dialer and plaintext
//! transport; remote endpoints keep whatever the caller asked for.

mod dial;
mod endpoint;
mod error;

pub use dial::{
    Connection, DEFAULT_DIAL_TIMEOUT, DialOption, choose_dial_opts, connect, dial, with_deadline,
};
pub use endpoint::{Endpoint, Scheme};
pub use error::DialError;
