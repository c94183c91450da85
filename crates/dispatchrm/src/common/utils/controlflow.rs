#[macro_export]
macro_rules! get_or_return {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            _ => return,
        }
    };
}

/// Like [`get_or_return`], but logs a warning with the given message before returning.
#[macro_export]
macro_rules! get_or_warn {
    ($e:expr, $($arg:tt)+) => {
        match $e {
            Some(v) => v,
            _ => {
                log::warn!($($arg)+);
                return;
            }
        }
    };
}
