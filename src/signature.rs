//! Typed view of a hookable function pointer.

use crate::dispatch::MockSlot;
use core::ffi::c_void;

/// A C-ABI function pointer type whose calls can be intercepted.
///
/// Implemented for `extern "C" fn(A, B, ..) -> R` with up to eight parameters.
///
/// # Safety
/// Implementors must be plain function pointers, so that converting to and
/// from an address is lossless.
pub unsafe trait Signature: Copy + Send + Sync + 'static {
    /// Parameters as a tuple.
    type Args: 'static;
    type Output: 'static;
    const ARITY: usize;

    fn addr(self) -> *const c_void;

    /// # Safety
    /// `addr` must be the entry point of a function with this exact signature.
    unsafe fn from_addr(addr: *const c_void) -> Self;

    fn call(self, args: Self::Args) -> Self::Output;

    /// A thunk of this signature that forwards every call into `S`'s mock.
    fn dispatcher<S: MockSlot<Fn = Self>>() -> Self;
}

macro_rules! impl_signature {
    ($n:expr; $($arg:ident : $ty:ident),*) => {
        unsafe impl<Ret: 'static, $($ty: 'static),*> Signature for extern "C" fn($($ty),*) -> Ret {
            type Args = ($($ty,)*);
            type Output = Ret;
            const ARITY: usize = $n;

            fn addr(self) -> *const c_void {
                self as *const c_void
            }

            unsafe fn from_addr(addr: *const c_void) -> Self {
                core::mem::transmute_copy::<*const c_void, Self>(&addr)
            }

            #[allow(clippy::unused_unit)]
            fn call(self, ($($arg,)*): Self::Args) -> Ret {
                (self)($($arg),*)
            }

            fn dispatcher<S: MockSlot<Fn = Self>>() -> Self {
                #[allow(improper_ctypes_definitions)]
                extern "C" fn thunk<S: MockSlot, Ret: 'static, $($ty: 'static),*>($($arg: $ty),*) -> Ret
                where
                    S::Fn: Signature<Args = ($($ty,)*), Output = Ret>,
                {
                    crate::dispatch::dispatch::<S>(($($arg,)*))
                }
                thunk::<S, Ret, $($ty),*>
            }
        }
    };
}

impl_signature!(0;);
impl_signature!(1; a: A);
impl_signature!(2; a: A, b: B);
impl_signature!(3; a: A, b: B, c: C);
impl_signature!(4; a: A, b: B, c: C, d: D);
impl_signature!(5; a: A, b: B, c: C, d: D, e: E);
impl_signature!(6; a: A, b: B, c: C, d: D, e: E, f: G);
impl_signature!(7; a: A, b: B, c: C, d: D, e: E, f: G, g: H);
impl_signature!(8; a: A, b: B, c: C, d: D, e: E, f: G, g: H, h: I);
