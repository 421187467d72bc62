mod dispatcher;
mod metrics;
pub mod models;
pub mod retry;
mod transport;

pub use self::dispatcher::{
    BlockTag, DispatchError, DispatchErrorExt, Dispatcher, DispatcherOptions, DispatcherService,
    LogQuery, LogRange,
};
pub use self::retry::{FailureClass, RetryOptions};
pub use self::transport::{HttpTransport, RpcFailure, RpcTransport};
