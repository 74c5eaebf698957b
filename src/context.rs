// src/context.rs
//! `.context()` for device results and missing handles, plus `bail!` /
//! `ensure!`. Context layers never hide the error kind: [`RenderError::kind`]
//! looks through them, so a wrapped `ContextLost` still triggers recovery.

use crate::error::{RenderError, Result};

/// `.context()` / `.with_context()` on any `Result` whose error converts into
/// [`RenderError`].
pub trait Context<T, E> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    /// Lazy variant; the closure only runs on the error path.
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<RenderError>,
{
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(f()))
    }
}

/// Turns a missing handle into a [`RenderError::Custom`].
pub trait OptionContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| RenderError::custom(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| RenderError::custom(f()))
    }
}

/// Early return with an error: `bail!("msg")`, `bail!(err)` or formatted.
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::error::RenderError::msg($msg))
    };
    ($err:expr $(,)?) => {
        return Err(Into::<$crate::error::RenderError>::into($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::RenderError::format(format_args!($fmt, $($arg)*)))
    };
}

/// Ensure a condition holds, else return the given error.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if !($cond) {
            $crate::bail!($err);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($fmt, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked_half(value: u32) -> Result<u32> {
        ensure!(value % 2 == 0, "odd value {}", value);
        Ok(value / 2)
    }

    #[test]
    fn ensure_formats_message() {
        assert_eq!(checked_half(8).ok(), Some(4));
        let err = checked_half(3).unwrap_err();
        assert_eq!(err.to_string(), "odd value 3");
    }

    #[test]
    fn wrapped_loss_is_still_a_loss() {
        let lost: Result<()> = Err(RenderError::context_lost("reset"));
        let err = lost.context("submitting frame 7").unwrap_err();
        assert!(err.is_context_lost());
        assert!(err.to_string().contains("submitting frame 7"));
    }

    #[test]
    fn option_context_produces_custom_error() {
        let missing: Option<u8> = None;
        let err = missing.context("no slot").unwrap_err();
        assert_eq!(err.to_string(), "no slot");
    }
}
