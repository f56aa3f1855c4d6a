pub mod banner;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod messages;
pub mod models;
pub mod packet;
pub mod provider;
pub mod session;
pub mod transport;

pub use banner::DisconnectBanner;
pub use config::RealtimeConfig;
pub use dispatcher::{Event, EventDispatcher, EventKind, Listener, Subscription, Topic};
pub use error::{RealtimeError, Result};
pub use messages::{Ack, AckCallback};
pub use models::{AuthState, Message, Notification, NotificationKind, Party};
pub use provider::{Phase, SessionProvider};
pub use session::RealtimeSession;
pub use transport::{Connector, HttpTokenProvider, SocketIoConnector, TokenProvider};
