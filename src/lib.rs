pub mod callcmd;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod logging;
pub mod message;
pub mod plugin;
pub mod proto;
pub mod router;
pub mod session;
pub mod socket;
pub mod status;

pub use callcmd::{CallCmd, CallNotify};
pub use config::{EndpointConfig, LoggingConfig};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{Result, RpcError};
pub use exchange::{CallCtx, Exchange, PushCtx};
pub use message::{Message, MessageSetting, MessageType, Meta};
pub use plugin::{HookResult, Plugin, PluginContainer};
pub use router::{Handler, Router, SubRouter};
pub use session::{AuthRequest, Session, SessionState};
pub use status::Status;
