pub mod coordinator;
pub mod dispatcher;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{BulkAggregator, BulkCoordinator, BulkHandle};
pub use dispatcher::{PollPolicy, ResolveHandle, TaskDispatcher};
pub use transport::{HttpTransport, TaskTransport, DEFAULT_REQUEST_TIMEOUT};
