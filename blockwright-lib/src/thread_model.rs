/// The maximum concurrency a backend can safely accept. Ordered from
/// most to least restrictive; the server takes the minimum across the
/// whole pipeline and applies the corresponding lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadModel {
    /// At most one connection live at a time.
    SerializeConnections,
    /// At most one request in flight process-wide.
    SerializeAllRequests,
    /// At most one request per connection.
    SerializeRequests,
    /// Concurrent requests on one connection are permitted.
    Parallel,
}

impl ThreadModel {
    /// Reconciles a pipeline's declared models to the single effective
    /// model the server enforces (the minimum/most-restrictive one).
    pub fn reconcile(models: impl IntoIterator<Item = ThreadModel>) -> ThreadModel {
        models.into_iter().min().unwrap_or(ThreadModel::Parallel)
    }
}

impl Default for ThreadModel {
    fn default() -> Self {
        ThreadModel::Parallel
    }
}
