use crate::record::Record;
use crate::resolver::Resolver;
use crate::result::DnsResult;
use crate::{Error, Result, naptr, rr, srv};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Opaque, reference counted user data attached to a query.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Completion callback of a single query, invoked exactly once.
pub type ResolveCallback = Box<dyn FnOnce(&Query) + Send>;

/// A single in-flight DNS question.
///
/// Queries are shared between the caller facing [`ActiveQuery`] handle and
/// the backend driving the resolution. The backend attaches a result with
/// [`set_result`](Query::set_result) / [`add_record`](Query::add_record) and
/// then signals [`completed`](Query::completed), which publishes the result
/// and invokes the caller's callback.
pub struct Query {
    name: String,
    rr_type: u16,
    rr_class: u16,
    user_data: UserData,
    resolver: Arc<dyn Resolver>,
    resolver_data: OnceLock<Box<dyn Any + Send + Sync>>,
    callback: Mutex<Option<ResolveCallback>>,
    /// Result under construction by the backend.
    staged: Mutex<Option<DnsResult>>,
    /// Result visible to callers, immutable once set.
    published: OnceLock<Arc<DnsResult>>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("name", &self.name)
            .field("rr_type", &self.rr_type)
            .field("rr_class", &self.rr_class)
            .finish_non_exhaustive()
    }
}

impl Query {
    pub(crate) fn new(
        name: &str,
        rr_type: u16,
        rr_class: u16,
        resolver: Arc<dyn Resolver>,
        callback: ResolveCallback,
        user_data: UserData,
    ) -> Self {
        Self {
            name: name.to_owned(),
            rr_type,
            rr_class,
            user_data,
            resolver,
            resolver_data: OnceLock::new(),
            callback: Mutex::new(Some(callback)),
            staged: Mutex::new(None),
            published: OnceLock::new(),
        }
    }

    /// The name being resolved.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resource record type being resolved.
    pub fn rr_type(&self) -> u16 {
        self.rr_type
    }

    /// The resource record class being resolved.
    pub fn rr_class(&self) -> u16 {
        self.rr_class
    }

    /// The user data handed to the engine when the query was started.
    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    /// The result of the query, available from within the completion
    /// callback onwards.
    pub fn result(&self) -> Option<&DnsResult> {
        self.published.get().map(|result| &**result)
    }

    pub(crate) fn shared_result(&self) -> Option<Arc<DnsResult>> {
        self.published.get().cloned()
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    // ==== backend facing API ====

    /// Attach backend private data to the query. May be called at most once.
    pub fn set_resolver_data<T: Any + Send + Sync>(&self, data: T) -> Result<()> {
        self.resolver_data
            .set(Box::new(data))
            .map_err(|_| Error::InvalidArgument("resolver data may only be set once"))
    }

    /// Retrieve backend private data of type `T` previously attached with
    /// [`set_resolver_data`](Query::set_resolver_data).
    pub fn resolver_data<T: Any>(&self) -> Option<&T> {
        self.resolver_data.get().and_then(|data| data.downcast_ref())
    }

    /// Begin a result for the query, replacing any result staged earlier.
    ///
    /// Fails if the result would be both secure and bogus, or the canonical
    /// name or raw answer are empty.
    pub fn set_result(
        &self,
        secure: bool,
        bogus: bool,
        rcode: u16,
        canonical: &str,
        answer: &[u8],
    ) -> Result<()> {
        let result = DnsResult::new(secure, bogus, rcode, canonical, answer)?;

        *self.staged.lock() = Some(result);

        Ok(())
    }

    /// Append a record to the staged result.
    ///
    /// SRV, NAPTR and TXT records are parsed into their typed views, with
    /// access to the full answer for domain name decompression. A malformed
    /// record fails with [`Error::Malformed`] and is not added; backends are
    /// expected to drop it and carry on with the remaining records.
    pub fn add_record(&self, rr_type: u16, rr_class: u16, ttl: u32, rdata: &[u8]) -> Result<()> {
        if rdata.is_empty() {
            return Err(Error::InvalidArgument("no record data specified"));
        }

        let mut staged = self.staged.lock();

        let result = staged
            .as_mut()
            .ok_or(Error::InvalidArgument("no result was set on the query"))?;

        let answer = result.answer_bytes();
        let record = Record::parse(&answer, rr_type, rr_class, ttl, rdata)?;
        result.push_record(record);

        Ok(())
    }

    /// Signal that resolution has finished.
    ///
    /// Sorts the staged records in place (SRV and NAPTR have defined
    /// orderings), publishes the result and invokes the completion callback.
    /// The callback runs without any engine lock held and at most once, no
    /// matter how often completion is signalled.
    pub fn completed(&self) {
        if let Some(mut result) = self.staged.lock().take() {
            match self.rr_type {
                rr::SRV => srv::sort(result.records_mut()),
                rr::NAPTR => naptr::sort(result.records_mut()),
                _ => {}
            }

            let _ = self.published.set(Arc::new(result));
        }

        let callback = self.callback.lock().take();

        if let Some(callback) = callback {
            callback(self);
        }
    }
}

/// Caller visible handle of a started query.
///
/// Dropping the handle detaches the caller from the query but does not
/// cancel the resolution.
#[derive(Debug)]
pub struct ActiveQuery {
    query: Arc<Query>,
}

impl ActiveQuery {
    pub(crate) fn new(query: Arc<Query>) -> Self {
        Self { query }
    }

    /// The underlying query.
    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    /// Ask the backend to cancel the resolution.
    ///
    /// On success the completion callback is guaranteed not to run. A
    /// backend which can no longer cancel the query returns an error and
    /// the pending completion is delivered as usual.
    pub fn cancel(&self) -> Result<()> {
        self.query.resolver().cancel(&self.query)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rr;
    use crate::test_helpers::StaticResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn query(callback: ResolveCallback) -> Query {
        Query::new(
            "example.test",
            rr::A,
            rr::class::IN,
            StaticResolver::new(0),
            callback,
            Arc::new(()),
        )
    }

    #[test]
    fn resolver_data_is_set_once() {
        let query = query(Box::new(|_| {}));

        assert!(query.set_resolver_data(41_u32).is_ok());
        assert!(query.set_resolver_data(42_u32).is_err());
        assert_eq!(query.resolver_data::<u32>(), Some(&41));
    }

    #[test]
    fn add_record_requires_result() {
        let query = query(Box::new(|_| {}));

        assert!(
            query
                .add_record(rr::A, rr::class::IN, 60, &[127, 0, 0, 1])
                .is_err()
        );
    }

    #[test]
    fn completion_is_signalled_once() {
        static INVOKED: AtomicUsize = AtomicUsize::new(0);

        let query = query(Box::new(|_| {
            INVOKED.fetch_add(1, Ordering::SeqCst);
        }));

        query
            .set_result(false, false, 0, "example.test", b"answer")
            .unwrap();
        query.completed();
        query.completed();

        assert_eq!(INVOKED.load(Ordering::SeqCst), 1);
        assert!(query.result().is_some());
    }

    #[test]
    fn result_immutable_after_completion() {
        let query = query(Box::new(|_| {}));

        query
            .set_result(false, false, 0, "example.test", b"answer")
            .unwrap();
        query
            .add_record(rr::A, rr::class::IN, 60, &[127, 0, 0, 2])
            .unwrap();
        query.completed();

        // A second staged result must not replace the published one
        query
            .set_result(false, false, 0, "other.test", b"other")
            .unwrap();
        query.completed();

        let result = query.result().unwrap();
        assert_eq!(result.canonical(), "example.test");
        assert_eq!(result.records().count(), 1);
    }
}
