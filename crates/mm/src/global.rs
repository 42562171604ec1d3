//! Process-wide state of the memory manager.
//!
//! Kernel builds keep every global in a `spin::Mutex` static. Under test or software
//! emulation each global is thread-local instead, so that every test thread boots its own
//! machine (the same split the address translator uses).
//!
//! Locks taken through the generated accessor must not be held across calls into another
//! component; the accessors are not reentrant.

/// Declares a process-wide global and a closure-based accessor for it.
///
/// ```ignore
/// kernel_global! {
///     static COUNTER: usize = 0;
///     fn with_counter;
/// }
///
/// with_counter(|counter| *counter += 1);
/// ```
macro_rules! kernel_global {
    (
        $(#[$meta:meta])*
        static $name:ident: $ty:ty = $init:expr;
        fn $accessor:ident;
    ) => {
        $(#[$meta])*
        #[cfg(not(any(test, feature = "software-emulation")))]
        static $name: spin::Mutex<$ty> = spin::Mutex::new($init);

        #[cfg(any(test, feature = "software-emulation"))]
        std::thread_local! {
            $(#[$meta])*
            static $name: spin::Mutex<$ty> = const { spin::Mutex::new($init) };
        }

        fn $accessor<R>(f: impl FnOnce(&mut $ty) -> R) -> R {
            #[cfg(not(any(test, feature = "software-emulation")))]
            {
                f(&mut $name.lock())
            }

            #[cfg(any(test, feature = "software-emulation"))]
            {
                $name.with(|state| f(&mut state.lock()))
            }
        }
    };
}

pub(crate) use kernel_global;
