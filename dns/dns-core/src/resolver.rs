use crate::Result;
use crate::query::Query;
use std::sync::Arc;

/// A pluggable resolver backend.
///
/// Backends are registered with [`Dns::register`](crate::Dns::register) and
/// selected by priority whenever a query is started. A registered backend
/// must accept concurrent [`resolve`](Resolver::resolve) and
/// [`cancel`](Resolver::cancel) calls on distinct queries.
pub trait Resolver: Send + Sync + 'static {
    /// Unique name of the backend.
    fn name(&self) -> &str;

    /// Relative priority of the backend, lower values are preferred.
    fn priority(&self) -> u16;

    /// Start resolution of the given query.
    ///
    /// Must not block. The backend performs the lookup on a thread it owns,
    /// attaches a result through the backend facing [`Query`] API and
    /// finally calls [`Query::completed`]. Returning an error means the
    /// query never started and no callback will be invoked for it.
    fn resolve(&self, query: &Arc<Query>) -> Result<()>;

    /// Cancel resolution of the given query.
    ///
    /// Returning `Ok` promises that the completion callback will not be
    /// invoked and releases the backend's interest in the query. A backend
    /// which cannot stop the query in time must return an error and still
    /// deliver the completion.
    fn cancel(&self, query: &Query) -> Result<()>;
}
