//! ptun core - control-plane building blocks of the packet tunnel
//!
//! - **Retry delays**: lazy backoff sequences ([`RetryDelay`])
//! - **Connectivity adaptor**: reconnect/throttle decisions after a
//!   connectivity loss ([`ConnectivityAdaptorManager`])
//! - **Route resolver**: one-shot routing table queries used to keep new
//!   flows off the tunnel interface ([`RouteResolver`])

mod connectivity;
mod retry;
pub mod route;

pub use connectivity::{ConnectivityAdaptor, ConnectivityAdaptorManager, Decision, RetryStrategy};
pub use retry::{RetryDelay, RetryDelayIter};
pub use route::{RouteResolution, RouteResolutionError, RouteResolver};
