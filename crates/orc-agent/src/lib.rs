pub mod retry;
pub mod subprocess;

pub use retry::invoke_with_backoff;
pub use subprocess::SubprocessBackend;
