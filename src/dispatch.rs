//! Signature-matching thunks that forward intercepted calls into a call handler.
//!
//! A [`Mockable`] is a hookable declaration plus a handler slot. Installing it
//! redirects the function to a generated thunk; the thunk counts the call and
//! hands the arguments to the current [`CallHandler`], or to the original
//! function when the scope has no handler yet.

use crate::registry::Hookable;
use crate::scoped::ScopedInstall;
use crate::signature::Signature;
use crate::types::Result;
use core::ffi::c_void;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// One intercepted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation<A> {
    /// Position of this call among those seen by the handler, from 0.
    pub index: u64,
    pub args: A,
}

/// Receives intercepted calls and computes their return value.
pub trait CallHandler<A, R>: Send + Sync {
    fn on_call(&self, call: Invocation<A>) -> R;
}

impl<A, R, T> CallHandler<A, R> for T
where
    T: Fn(Invocation<A>) -> R + Send + Sync,
{
    fn on_call(&self, call: Invocation<A>) -> R {
        self(call)
    }
}

/// Ties a generated thunk to its [`Mockable`] static. Implemented by
/// [`declare_mockable!`](crate::declare_mockable).
pub trait MockSlot: 'static {
    type Fn: Signature;
    fn mockable() -> &'static Mockable<Self::Fn>;
}

struct ActiveHandler<A, R> {
    handler: Box<dyn CallHandler<A, R>>,
    calls: AtomicU64,
}

type Slot<F> = Option<Arc<ActiveHandler<<F as Signature>::Args, <F as Signature>::Output>>>;

/// A hookable function whose replacement is a dispatching thunk.
pub struct Mockable<F: Signature> {
    hookable: Hookable<F>,
    handler: RwLock<Slot<F>>,
    calls: AtomicU64,
    dispatcher: fn() -> F,
}

impl<F: Signature> core::fmt::Debug for Mockable<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mockable")
            .field("hookable", &self.hookable)
            .field("calls", &self.call_count())
            .finish()
    }
}

impl<F: Signature> Mockable<F> {
    pub const fn new(
        name: &'static str,
        signature: &'static str,
        resolve: fn() -> *const c_void,
        dispatcher: fn() -> F,
    ) -> Self {
        Self {
            hookable: Hookable::new(name, signature, resolve),
            handler: RwLock::new(None),
            calls: AtomicU64::new(0),
            dispatcher,
        }
    }

    pub fn hookable(&'static self) -> &'static Hookable<F> {
        &self.hookable
    }

    /// Calls that reached the thunk, handled or passed through.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Route calls into `handler` until the returned scope drops.
    pub fn install<H>(&'static self, handler: H) -> Result<MockScope<F>>
    where
        H: CallHandler<F::Args, F::Output> + 'static,
    {
        self.scope(Some(Self::activate(handler)))
    }

    /// Install the thunk without a handler: calls go to the original function
    /// until [`MockScope::set_handler`] is called.
    pub fn install_passthrough(&'static self) -> Result<MockScope<F>> {
        self.scope(None)
    }

    fn activate<H>(handler: H) -> Arc<ActiveHandler<F::Args, F::Output>>
    where
        H: CallHandler<F::Args, F::Output> + 'static,
    {
        Arc::new(ActiveHandler {
            handler: Box::new(handler),
            calls: AtomicU64::new(0),
        })
    }

    fn swap_handler(&self, next: Slot<F>) -> Slot<F> {
        let mut slot = self.handler.write().unwrap_or_else(|e| e.into_inner());
        core::mem::replace(&mut *slot, next)
    }

    fn scope(&'static self, handler: Slot<F>) -> Result<MockScope<F>> {
        let previous = self.swap_handler(handler);
        match self.hookable.install((self.dispatcher)()) {
            Ok(guard) => Ok(MockScope {
                mockable: self,
                previous,
                guard: Some(guard),
            }),
            Err(e) => {
                self.swap_handler(previous);
                Err(e)
            }
        }
    }
}

/// Entry point of every generated thunk.
pub(crate) fn dispatch<S: MockSlot>(args: <S::Fn as Signature>::Args) -> <S::Fn as Signature>::Output {
    let mockable = S::mockable();
    mockable.calls.fetch_add(1, Ordering::SeqCst);
    // Clone out of the lock; the handler runs unlocked.
    let active = mockable.handler.read().unwrap_or_else(|e| e.into_inner()).clone();
    match active {
        Some(active) => {
            let index = active.calls.fetch_add(1, Ordering::SeqCst);
            active.handler.on_call(Invocation { index, args })
        }
        None => mockable.hookable.original().call(args),
    }
}

/// Keeps a [`Mockable`] installed. Dropping it removes the thunk (or
/// unshadows an enclosing hook) and restores the enclosing handler.
#[must_use = "the mock is removed when the scope is dropped"]
pub struct MockScope<F: Signature> {
    mockable: &'static Mockable<F>,
    previous: Slot<F>,
    guard: Option<ScopedInstall>,
}

impl<F: Signature> core::fmt::Debug for MockScope<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MockScope").field("mockable", self.mockable).finish()
    }
}

impl<F: Signature> MockScope<F> {
    pub fn set_handler<H>(&self, handler: H)
    where
        H: CallHandler<F::Args, F::Output> + 'static,
    {
        self.mockable.swap_handler(Some(Mockable::<F>::activate(handler)));
    }

    /// Go back to passing calls through to the original function.
    pub fn clear_handler(&self) {
        self.mockable.swap_handler(None);
    }

    /// Calls seen by the current handler.
    pub fn handled_calls(&self) -> u64 {
        let slot = self.mockable.handler.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map_or(0, |a| a.calls.load(Ordering::SeqCst))
    }

    pub fn guard(&self) -> Option<&ScopedInstall> {
        self.guard.as_ref()
    }
}

impl<F: Signature> Drop for MockScope<F> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.mockable.swap_handler(self.previous.take());
    }
}

struct LogInner<A, R> {
    calls: Mutex<Vec<Invocation<A>>>,
    respond: Box<dyn Fn(&A) -> R + Send + Sync>,
}

/// A [`CallHandler`] that records every call and answers with a responder.
///
/// Clones share the same record, so one clone can be installed while the
/// test keeps another to inspect.
pub struct CallLog<A, R> {
    inner: Arc<LogInner<A, R>>,
}

impl<A, R> Clone for CallLog<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Clone + Send + 'static, R: 'static> CallLog<A, R> {
    pub fn new(respond: impl Fn(&A) -> R + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(LogInner {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Vec<Invocation<A>>> {
        self.inner.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Recorded calls in invocation order.
    pub fn calls(&self) -> Vec<Invocation<A>> {
        let mut calls = self.locked().clone();
        calls.sort_by_key(|c| c.index);
        calls
    }

    pub fn args(&self) -> Vec<A> {
        self.calls().into_iter().map(|c| c.args).collect()
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.locked().clear();
    }
}

impl<A: Send + 'static, R: 'static> CallHandler<A, R> for CallLog<A, R> {
    fn on_call(&self, call: Invocation<A>) -> R {
        let out = (self.inner.respond)(&call.args);
        self.inner.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
        out
    }
}

/// Declare a mockable function.
///
/// ```ignore
/// declare_mockable!(pub CLOSE => libc::close as extern "C" fn(c_int) -> c_int);
/// ```
#[macro_export]
macro_rules! declare_mockable {
    ($vis:vis $name:ident => $path:path as $ty:ty) => {
        $vis static $name: $crate::Mockable<$ty> = {
            fn resolve() -> *const ::core::ffi::c_void {
                $crate::Signature::addr($path as $ty)
            }
            struct Slot;
            impl $crate::MockSlot for Slot {
                type Fn = $ty;
                fn mockable() -> &'static $crate::Mockable<$ty> {
                    &$name
                }
            }
            fn dispatcher() -> $ty {
                <$ty as $crate::Signature>::dispatcher::<Slot>()
            }
            $crate::Mockable::new(stringify!($path), stringify!($ty), resolve, dispatcher)
        };
    };
}
