pub mod handlers;
mod identity;
mod registry;
#[allow(clippy::module_inception)]
mod session;

pub use identity::Identity;
pub use registry::{SessionHandle, SessionRegistry};
pub use session::{Session, SessionError, SessionState};
