//! The cluster client: session registration, dispatch, and retries.

pub mod dispatcher;
pub mod session;
pub mod transport;

pub use dispatcher::{RaftClient, SessionEvent};
pub use session::{ClientSessionState, SessionView};
pub use transport::{ClientConnection, ClientTransport};
