pub mod auth;
pub mod binding;
pub mod buffer;
pub mod expr;
pub mod flow;
pub mod protocol;
pub mod session;

pub use auth::{sign_challenge, AuthError, Challenge};
pub use binding::{merge_bindings, BindingMap, BindingRequest, ChannelBinding, ChannelPort};
pub use buffer::DeltaBuffer;
pub use expr::{Equation, ExprError};
pub use flow::{AckCounter, AckWindow, TickOutcome};
pub use protocol::{AgentPresence, ProtocolError};
pub use session::{EmptyStackError, Lifecycle, SessionError, StateStack, Transition};

/// Hardware identity of an agent, `AA:BB:CC:DD:EE:FF`.
pub type AgentId = String;
