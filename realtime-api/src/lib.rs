pub mod auth;
pub mod backend;
pub mod handlers;
pub mod http;
pub mod socket;

pub use auth::{AuthContext, AuthError, AuthRequest, Authenticator, BackendAuthenticator};
pub use backend::BackendClient;
pub use handlers::{HandlerRegistry, HandlerSource, StaticHandlerSource, TenantHandler};
pub use http::{create_router, AppState};
pub use socket::{Socket, DISCONNECT_EVENT};
