mod echo;
mod health;

pub use echo::EchoHandler;
pub use health::{health_check, readiness_check};
