use crate::query::{ActiveQuery, Query, ResolveCallback, UserData};
use crate::query_set::QuerySet;
use crate::recurring::{RecurringCallback, RecurringQuery};
use crate::resolver::Resolver;
use crate::result::DnsResult;
use crate::sched::Scheduler;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// The DNS engine.
///
/// Owns the registry of pluggable resolver backends and the timer scheduler
/// driving recurring queries. It is a wrapper around an `Arc<Inner>`, which
/// makes it cheap to clone into every place that needs to issue queries.
#[derive(Clone, Default)]
pub struct Dns {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    resolvers: RwLock<Vec<Arc<dyn Resolver>>>,
    sched: OnceLock<Scheduler>,
}

impl fmt::Debug for Dns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dns")
            .field("resolvers", &self.inner.resolvers.read().len())
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(sched) = self.sched.get() {
            sched.shutdown();
        }
    }
}

impl Dns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver backend.
    ///
    /// Backends are kept sorted by [`priority`](Resolver::priority), lower
    /// values first; ties keep registration order. The first successful
    /// registration also starts the scheduler used by recurring queries.
    pub fn register(&self, resolver: Arc<dyn Resolver>) -> Result<()> {
        if resolver.name().is_empty() {
            log::error!("Registration of DNS resolver failed as it does not have a name");
            return Err(Error::NoName);
        }

        let mut resolvers = self.inner.resolvers.write();

        if resolvers.iter().any(|r| r.name() == resolver.name()) {
            log::error!(
                "A DNS resolver with the name '{}' is already registered",
                resolver.name()
            );
            return Err(Error::DuplicateName(resolver.name().to_owned()));
        }

        self.inner.sched.get_or_init(Scheduler::start);

        let pos = resolvers
            .iter()
            .position(|r| r.priority() > resolver.priority())
            .unwrap_or(resolvers.len());

        log::debug!(
            "Registered DNS resolver '{}' with priority '{}'",
            resolver.name(),
            resolver.priority()
        );

        resolvers.insert(pos, resolver);

        Ok(())
    }

    /// Unregister a previously registered backend, by identity. Safe to
    /// call with a backend that is not registered.
    pub fn unregister(&self, resolver: &Arc<dyn Resolver>) {
        let mut resolvers = self.inner.resolvers.write();

        if let Some(pos) = resolvers.iter().position(|r| Arc::ptr_eq(r, resolver)) {
            resolvers.remove(pos);
            log::debug!("Unregistered DNS resolver '{}'", resolver.name());
        }
    }

    /// The backend queries are currently routed to.
    pub(crate) fn selected(&self) -> Option<Arc<dyn Resolver>> {
        self.inner.resolvers.read().first().cloned()
    }

    pub(crate) fn sched(&self) -> Option<&Scheduler> {
        self.inner.sched.get()
    }

    /// Allocate a query bound to the currently selected backend without
    /// starting it.
    pub(crate) fn alloc_query(
        &self,
        name: &str,
        rr_type: u16,
        rr_class: u16,
        callback: ResolveCallback,
        user_data: UserData,
    ) -> Result<Arc<Query>> {
        if name.is_empty() {
            log::warn!("Could not perform resolution, no name provided");
            return Err(Error::InvalidArgument("no name provided"));
        }

        let Some(resolver) = self.selected() else {
            log::error!(
                "Attempted to do a DNS query for '{name}' of class '{rr_class}' and type '{rr_type}' but no resolver is available"
            );
            return Err(Error::NoResolver);
        };

        Ok(Arc::new(Query::new(
            name, rr_type, rr_class, resolver, callback, user_data,
        )))
    }

    pub(crate) fn start_query(&self, query: &Arc<Query>) -> Result<()> {
        query.resolver().resolve(query).inspect_err(|e| {
            log::error!(
                "Resolver '{}' returned an error when resolving '{}' of class '{}' and type '{}': {e}",
                query.resolver().name(),
                query.name(),
                query.rr_class(),
                query.rr_type(),
            );
        })
    }

    /// Asynchronously resolve `name`.
    ///
    /// The callback is invoked exactly once from a backend owned thread,
    /// unless the query is successfully cancelled through the returned
    /// [`ActiveQuery`].
    #[tracing::instrument(err, skip(self, callback, user_data))]
    pub fn resolve_async(
        &self,
        name: &str,
        rr_type: u16,
        rr_class: u16,
        callback: ResolveCallback,
        user_data: UserData,
    ) -> Result<ActiveQuery> {
        let query = self.alloc_query(name, rr_type, rr_class, callback, user_data)?;

        self.start_query(&query)?;

        Ok(ActiveQuery::new(query))
    }

    /// Synchronously resolve `name`, blocking the calling thread until the
    /// backend completes.
    #[tracing::instrument(err, skip(self))]
    pub fn resolve(&self, name: &str, rr_type: u16, rr_class: u16) -> Result<Arc<DnsResult>> {
        struct Signal {
            state: Mutex<(bool, Option<Arc<DnsResult>>)>,
            cond: Condvar,
        }

        let signal = Arc::new(Signal {
            state: Mutex::new((false, None)),
            cond: Condvar::new(),
        });

        let callback_signal = signal.clone();

        let _active = self.resolve_async(
            name,
            rr_type,
            rr_class,
            Box::new(move |query| {
                let mut state = callback_signal.state.lock();
                *state = (true, query.shared_result());
                callback_signal.cond.notify_one();
            }),
            Arc::new(()),
        )?;

        let mut state = signal.state.lock();
        while !state.0 {
            signal.cond.wait(&mut state);
        }

        state.1.take().ok_or(Error::EmptyResult)
    }

    /// Resolve `name` now and again whenever the lowest TTL of the previous
    /// answer lapses.
    pub fn resolve_recurring(
        &self,
        name: &str,
        rr_type: u16,
        rr_class: u16,
        callback: RecurringCallback,
        user_data: UserData,
    ) -> Result<RecurringQuery> {
        RecurringQuery::start(self.clone(), name, rr_type, rr_class, callback, user_data)
    }

    /// Create an empty query set resolving through this engine.
    pub fn query_set(&self) -> QuerySet {
        QuerySet::new(self.clone())
    }
}
