//! Branch hints. `nudge` gives us `likely`/`unlikely` on stable.

#[doc(hidden)]
#[inline(always)]
pub fn _unlikely(b: bool) -> bool {
    nudge::unlikely(b)
}

#[inline(always)]
#[doc(hidden)]
pub fn _likely(b: bool) -> bool {
    nudge::likely(b)
}

macro_rules! unlikely {
    ($e:expr) => {
        $crate::internal::optim::_unlikely($e)
    };
}

macro_rules! likely {
    ($e:expr) => {{
        $crate::internal::optim::_likely($e)
    }};
}

/// Fatal invariant check. Unlike `debug_assert!` this is kept in release builds: a broken orec
/// can not be recovered from.
macro_rules! invariant {
    ($e:expr, $($t:tt)*) => {
        if unlikely!(!$e) {
            $crate::internal::optim::_invariant_broken(format_args!($($t)*))
        }
    };
}

/// Unconditional invariant failure, usable in expression position.
macro_rules! fatal {
    ($($t:tt)*) => {
        $crate::internal::optim::_invariant_broken(format_args!($($t)*))
    };
}

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn _invariant_broken(args: core::fmt::Arguments<'_>) -> ! {
    panic!("reftx invariant broken: {}", args)
}
