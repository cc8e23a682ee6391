// Scanner transport: protocol messages and the HTTP plumbing that carries them.

pub mod http_source;
pub mod messages;
pub mod traits;
