use crate::engine::Dns;
use crate::query::{Query, UserData};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Completion callback of a query set, invoked at most once.
pub type QuerySetCallback = Box<dyn FnOnce(&QuerySet) + Send>;

const QUERY_PENDING: u8 = 0;
const QUERY_STARTED: u8 = 1;
const QUERY_CANCELLED: u8 = 2;

/// A parallel fan-out of independent queries with a single aggregate
/// completion callback.
///
/// Queries are added up front, then resolved together. The set level
/// callback fires once the last query has completed, on whichever thread
/// completed it, and is suppressed if every query was cancelled.
#[derive(Clone)]
pub struct QuerySet {
    inner: Arc<Inner>,
}

struct Inner {
    dns: Dns,
    queries: Mutex<Vec<Entry>>,
    in_progress: AtomicBool,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    callback: Mutex<Option<QuerySetCallback>>,
    user_data: Mutex<Option<UserData>>,
}

struct Entry {
    query: Arc<Query>,
    state: AtomicU8,
}

impl QuerySet {
    pub(crate) fn new(dns: Dns) -> Self {
        Self {
            inner: Arc::new(Inner {
                dns,
                queries: Mutex::new(Vec::new()),
                in_progress: AtomicBool::new(false),
                completed: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                callback: Mutex::new(None),
                user_data: Mutex::new(None),
            }),
        }
    }

    /// Append a query to the set. Fails with [`Error::AlreadyStarted`] once
    /// resolution has begun.
    pub fn add(&self, name: &str, rr_type: u16, rr_class: u16) -> Result<()> {
        if self.inner.in_progress.load(Ordering::Acquire) {
            log::error!(
                "Attempted to add additional query to query set after resolution has started"
            );
            return Err(Error::AlreadyStarted);
        }

        let set = self.clone();

        let query = self.inner.dns.alloc_query(
            name,
            rr_type,
            rr_class,
            Box::new(move |_| set.query_completed()),
            Arc::new(()),
        )?;

        self.inner.queries.lock().push(Entry {
            query,
            state: AtomicU8::new(QUERY_PENDING),
        });

        Ok(())
    }

    /// Number of queries in the set.
    pub fn num_queries(&self) -> usize {
        self.inner.queries.lock().len()
    }

    /// Retrieve a query of the set. Results are only handed out once every
    /// query has completed.
    pub fn query(&self, index: usize) -> Option<Arc<Query>> {
        let queries = self.inner.queries.lock();

        if self.inner.completed.load(Ordering::SeqCst) != queries.len() {
            return None;
        }

        queries.get(index).map(|entry| entry.query.clone())
    }

    /// The user data handed to [`resolve_async`](QuerySet::resolve_async).
    pub fn user_data(&self) -> Option<UserData> {
        self.inner.user_data.lock().clone()
    }

    /// Start parallel resolution of every query in the set.
    ///
    /// Queries whose backend refuses to start are treated as synthetically
    /// completed with an empty result.
    pub fn resolve_async(&self, callback: QuerySetCallback, user_data: UserData) -> Result<()> {
        if self.inner.in_progress.swap(true, Ordering::AcqRel) {
            log::error!(
                "Attempted to start asynchronous resolution of query set when it has already started"
            );
            return Err(Error::AlreadyStarted);
        }

        let queries: Vec<Arc<Query>> = {
            let queries = self.inner.queries.lock();

            if queries.is_empty() {
                return Err(Error::InvalidArgument("query set is empty"));
            }

            queries.iter().map(|entry| entry.query.clone()).collect()
        };

        *self.inner.callback.lock() = Some(callback);
        *self.inner.user_data.lock() = Some(user_data);

        for (idx, query) in queries.iter().enumerate() {
            if self.inner.dns.start_query(query).is_ok() {
                self.inner.queries.lock()[idx]
                    .state
                    .store(QUERY_STARTED, Ordering::Release);
            } else {
                // Synthetic completion, the per query callback still has
                // to run for the set to make progress
                query.completed();
            }
        }

        Ok(())
    }

    /// Resolve the whole set, blocking until the aggregate completion.
    pub fn resolve(&self) -> Result<()> {
        struct Signal {
            done: Mutex<bool>,
            cond: Condvar,
        }

        let signal = Arc::new(Signal {
            done: Mutex::new(false),
            cond: Condvar::new(),
        });

        let callback_signal = signal.clone();

        self.resolve_async(
            Box::new(move |_| {
                *callback_signal.done.lock() = true;
                callback_signal.cond.notify_one();
            }),
            Arc::new(()),
        )?;

        let mut done = signal.done.lock();
        while !*done {
            signal.cond.wait(&mut done);
        }

        Ok(())
    }

    /// Cancel every query in the set.
    ///
    /// Queries which never started count as cancelled. Succeeds only if
    /// every query ends up cancelled; in that case the set level callback
    /// is suppressed.
    pub fn cancel(&self) -> Result<()> {
        let queries: Vec<Arc<Query>> = {
            let queries = self.inner.queries.lock();
            queries.iter().map(|entry| entry.query.clone()).collect()
        };

        for (idx, query) in queries.iter().enumerate() {
            let state = self.inner.queries.lock()[idx].state.load(Ordering::Acquire);

            match state {
                QUERY_STARTED => {
                    if query.resolver().cancel(query).is_ok() {
                        self.inner.queries.lock()[idx]
                            .state
                            .store(QUERY_CANCELLED, Ordering::Release);
                        self.inner.cancelled.fetch_add(1, Ordering::SeqCst);
                        query.completed();
                    }
                }
                QUERY_PENDING => {
                    self.inner.queries.lock()[idx]
                        .state
                        .store(QUERY_CANCELLED, Ordering::Release);
                    self.inner.cancelled.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }

        if self.inner.cancelled.load(Ordering::SeqCst) == queries.len() {
            Ok(())
        } else {
            Err(Error::Backend(
                "not every query of the set could be cancelled".into(),
            ))
        }
    }

    /// Per query completion accounting. The thread observing the final
    /// completion delivers the set level callback.
    fn query_completed(&self) {
        let total = self.inner.queries.lock().len();

        if self.inner.completed.fetch_add(1, Ordering::SeqCst) != total - 1 {
            return;
        }

        if self.inner.cancelled.load(Ordering::SeqCst) != total {
            let callback = self.inner.callback.lock().take();

            if let Some(callback) = callback {
                callback(self);
            }
        }

        *self.inner.user_data.lock() = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{ManualResolver, StaticAnswer, StaticResolver};
    use crate::{rcode, rr};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn engine_with_static() -> Dns {
        let resolver = StaticResolver::new(0);

        for (name, addr) in [
            ("one.test", Ipv4Addr::new(127, 0, 0, 1)),
            ("two.test", Ipv4Addr::new(127, 0, 0, 2)),
            ("three.test", Ipv4Addr::new(127, 0, 0, 3)),
            ("four.test", Ipv4Addr::new(127, 0, 0, 4)),
        ] {
            let mut answer = StaticAnswer::new(rcode::NOERROR);
            answer.a(addr, 60);
            resolver.insert(name, rr::A, answer);
        }

        let dns = Dns::new();
        dns.register(resolver).unwrap();
        dns
    }

    #[test]
    fn all_queries_complete_and_callback_fires_once() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        let dns = engine_with_static();
        let set = dns.query_set();

        for name in ["one.test", "two.test", "three.test", "four.test"] {
            set.add(name, rr::A, rr::class::IN).unwrap();
        }

        let (tx, rx) = std::sync::mpsc::channel();

        set.resolve_async(
            Box::new(move |set| {
                FIRED.fetch_add(1, Ordering::SeqCst);
                tx.send(set.num_queries()).unwrap();
            }),
            Arc::new(()),
        )
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        for idx in 0..set.num_queries() {
            let query = set.query(idx).unwrap();
            let result = query.result().unwrap();
            assert_eq!(result.records().count(), 1);
        }

        assert!(set.query(4).is_none());
    }

    #[test]
    fn add_after_start_fails() {
        let dns = engine_with_static();
        let set = dns.query_set();

        set.add("one.test", rr::A, rr::class::IN).unwrap();
        set.resolve().unwrap();

        assert!(matches!(
            set.add("two.test", rr::A, rr::class::IN),
            Err(Error::AlreadyStarted)
        ));
    }

    #[test]
    fn resolving_twice_fails() {
        let dns = engine_with_static();
        let set = dns.query_set();
        set.add("one.test", rr::A, rr::class::IN).unwrap();

        set.resolve().unwrap();
        assert!(matches!(
            set.resolve_async(Box::new(|_| {}), Arc::new(())),
            Err(Error::AlreadyStarted)
        ));
    }

    #[test]
    fn empty_set_is_rejected() {
        let dns = engine_with_static();
        let set = dns.query_set();

        assert!(matches!(
            set.resolve_async(Box::new(|_| {}), Arc::new(())),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn cancelling_everything_suppresses_the_callback() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        let resolver = ManualResolver::new(0);
        let dns = Dns::new();
        dns.register(resolver.clone()).unwrap();

        let set = dns.query_set();
        for name in ["one.test", "two.test", "three.test", "four.test"] {
            set.add(name, rr::A, rr::class::IN).unwrap();
        }

        set.resolve_async(
            Box::new(|_| {
                FIRED.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(()),
        )
        .unwrap();

        set.cancel().unwrap();
        resolver.complete_all();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_resolves_count_as_completions() {
        struct Failing;

        impl crate::Resolver for Failing {
            fn name(&self) -> &str {
                "failing"
            }

            fn priority(&self) -> u16 {
                0
            }

            fn resolve(&self, _query: &Arc<Query>) -> Result<()> {
                Err(Error::Backend("nope".into()))
            }

            fn cancel(&self, _query: &Query) -> Result<()> {
                Err(Error::Backend("nope".into()))
            }
        }

        let dns = Dns::new();
        dns.register(Arc::new(Failing)).unwrap();

        let set = dns.query_set();
        set.add("one.test", rr::A, rr::class::IN).unwrap();
        set.add("two.test", rr::A, rr::class::IN).unwrap();

        // Every query fails to start, the set still completes
        set.resolve().unwrap();

        let query = set.query(0).unwrap();
        assert!(query.result().is_none());
    }
}
