use crate::engine::Dns;
use crate::query::{ActiveQuery, Query, UserData};
use crate::sched::TimerToken;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Callback of a recurring query, invoked once per completed resolution
/// with the query and the user data the recurrence was started with.
pub type RecurringCallback = Arc<dyn Fn(&Query, &UserData) + Send + Sync>;

/// Longest delay between two resolutions, in seconds.
const MAX_INTERVAL: u32 = i32::MAX as u32 / 1000;

/// A query which re-issues itself whenever the lowest TTL of its previous
/// answer lapses.
///
/// The recurrence ends on its own once an answer carries no usable TTL
/// (all zero, no records, or NXDOMAIN), or when [`cancel`](RecurringQuery::cancel)
/// is called.
#[derive(Clone)]
pub struct RecurringQuery {
    inner: Arc<Inner>,
}

struct Inner {
    dns: Dns,
    name: String,
    rr_type: u16,
    rr_class: u16,
    callback: RecurringCallback,
    user_data: UserData,
    state: Mutex<State>,
}

/// At most one of `active` and `timer` is set at any time.
#[derive(Default)]
struct State {
    active: Option<ActiveQuery>,
    timer: Option<TimerToken>,
    cancelled: bool,
}

impl RecurringQuery {
    pub(crate) fn start(
        dns: Dns,
        name: &str,
        rr_type: u16,
        rr_class: u16,
        callback: RecurringCallback,
        user_data: UserData,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("no name provided"));
        }

        // The scheduler only exists once a resolver has been registered
        if dns.sched().is_none() {
            return Err(Error::NoResolver);
        }

        let inner = Arc::new(Inner {
            dns,
            name: name.to_owned(),
            rr_type,
            rr_class,
            callback,
            user_data,
            state: Mutex::new(State::default()),
        });

        // Hold the state lock across the first issue so a completion on the
        // backend thread cannot observe `active` before it is assigned
        let mut state = inner.state.lock();
        state.active = Some(Self::issue(&inner)?);
        drop(state);

        Ok(Self { inner })
    }

    fn issue(inner: &Arc<Inner>) -> Result<ActiveQuery> {
        let hook = inner.clone();

        inner.dns.resolve_async(
            &inner.name,
            inner.rr_type,
            inner.rr_class,
            Box::new(move |query| Self::resolution_completed(&hook, query)),
            inner.user_data.clone(),
        )
    }

    fn resolution_completed(inner: &Arc<Inner>, query: &Query) {
        (inner.callback)(query, &inner.user_data);

        let mut state = inner.state.lock();

        if !state.cancelled {
            let ttl = query
                .result()
                .map(|result| result.lowest_ttl())
                .unwrap_or(0)
                .min(MAX_INTERVAL);

            if ttl != 0
                && let Some(sched) = inner.dns.sched()
            {
                let hook = inner.clone();
                state.timer = Some(sched.schedule(Duration::from_secs(u64::from(ttl)), move || {
                    Self::timer_lapsed(&hook);
                }));
            }
        }

        state.active = None;
    }

    fn timer_lapsed(inner: &Arc<Inner>) {
        let mut state = inner.state.lock();
        state.timer = None;

        if state.cancelled {
            return;
        }

        match Self::issue(inner) {
            Ok(active) => state.active = Some(active),
            Err(e) => {
                log::error!(
                    "Failed to re-issue recurring DNS query for '{}': {e}",
                    inner.name
                );
            }
        }
    }

    /// Stop the recurrence.
    ///
    /// Deletes any pending timer and asks the backend to cancel an
    /// in-flight query; the backend's cancel result is returned. After
    /// cancellation no further timer or query is created, even if an
    /// uncancellable in-flight query still completes.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.inner.state.lock();

        state.cancelled = true;

        if let Some(timer) = state.timer.take()
            && let Some(sched) = self.inner.dns.sched()
        {
            sched.cancel(timer);
        }

        match state.active.take() {
            Some(active) => active.cancel(),
            None => Ok(()),
        }
    }
}
