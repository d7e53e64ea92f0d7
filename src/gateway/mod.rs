pub mod auth;
pub mod game_stream;
pub mod handler;
pub mod manager;
pub mod roles;
pub mod session;

pub use auth::TokenAuthenticator;
pub use game_stream::GameStreamConnector;
pub use handler::{Authenticator, GameNotifier, GatewayHandler, RoleStore};
pub use manager::SessionManager;
pub use roles::SledRoleStore;
pub use session::GatewaySession;
