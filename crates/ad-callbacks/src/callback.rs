//! Typed user callbacks
//!
//! A [`Callback`] is either a plain function, run on a blocking worker, or a
//! function returning a future, awaited on the slot's cooperative runner.
//! [`Callback::bind`] pairs it with its arguments to produce an [`Invocation`]
//! that the worker pool can execute without knowing the argument type.

use ad_core::Kwargs;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future returned by async callbacks
pub type CallbackFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A user callback taking arguments of type `A`
pub enum Callback<A> {
    Sync(Arc<dyn Fn(A) -> anyhow::Result<()> + Send + Sync>),
    Async(Arc<dyn Fn(A) -> CallbackFuture + Send + Sync>),
}

impl<A> Clone for Callback<A> {
    fn clone(&self) -> Self {
        match self {
            Callback::Sync(f) => Callback::Sync(f.clone()),
            Callback::Async(f) => Callback::Async(f.clone()),
        }
    }
}

impl<A> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Sync(_) => f.write_str("Callback::Sync"),
            Callback::Async(_) => f.write_str("Callback::Async"),
        }
    }
}

impl<A: Send + 'static> Callback<A> {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Callback::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Callback::Async(Arc::new(move |args| Box::pin(f(args)) as CallbackFuture))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Callback::Async(_))
    }

    /// Attach arguments, producing a unit of work
    pub fn bind(&self, args: A) -> Invocation {
        match self {
            Callback::Sync(f) => {
                let f = f.clone();
                Invocation::Blocking(Box::new(move || f(args)))
            }
            Callback::Async(f) => Invocation::Async(f(args)),
        }
    }
}

/// A callback bound to its arguments, ready to run
pub enum Invocation {
    Blocking(Box<dyn FnOnce() -> anyhow::Result<()> + Send>),
    Async(CallbackFuture),
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Blocking(_) => f.write_str("Invocation::Blocking"),
            Invocation::Async(_) => f.write_str("Invocation::Async"),
        }
    }
}

/// Arguments handed to a state callback
#[derive(Debug, Clone, PartialEq)]
pub struct StateArgs {
    pub entity_id: String,
    pub attribute: String,
    pub old: Value,
    pub new: Value,
    pub kwargs: Kwargs,
}

/// Arguments handed to an event callback
#[derive(Debug, Clone, PartialEq)]
pub struct EventArgs {
    pub event_type: String,
    pub data: Value,
    pub kwargs: Kwargs,
}

/// Arguments handed to a log callback
#[derive(Debug, Clone, PartialEq)]
pub struct LogArgs {
    pub app_name: String,
    pub ts: DateTime<Utc>,
    pub level: String,
    pub log_type: String,
    pub message: String,
    pub kwargs: Kwargs,
}

/// Arguments handed to a timer callback
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimerArgs {
    pub kwargs: Kwargs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sync_bind_runs_with_args() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let cb = Callback::sync(move |args: TimerArgs| {
            counter.fetch_add(args.kwargs.len(), Ordering::SeqCst);
            Ok(())
        });

        let mut kwargs = Kwargs::new();
        kwargs.insert("a".into(), Value::from(1));
        match cb.bind(TimerArgs { kwargs }) {
            Invocation::Blocking(f) => f().unwrap(),
            Invocation::Async(_) => panic!("expected blocking invocation"),
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!cb.is_async());
    }

    #[tokio::test]
    async fn test_async_bind_produces_future() {
        let cb = Callback::from_async(|args: EventArgs| async move {
            anyhow::ensure!(args.event_type == "ping", "wrong event");
            Ok(())
        });
        assert!(cb.is_async());

        let invocation = cb.bind(EventArgs {
            event_type: "ping".into(),
            data: Value::Null,
            kwargs: Kwargs::new(),
        });
        match invocation {
            Invocation::Async(fut) => fut.await.unwrap(),
            Invocation::Blocking(_) => panic!("expected async invocation"),
        }
    }
}
