//! Declarative helpers shared across the crate.

/// Declares numeric error codes together with their human readable messages.
///
/// Expands to one `pub const` per code plus `get_error_message(code)`.
macro_rules! define_error_codes {
    ($($name:ident = $code:expr => $msg:expr),* $(,)?) => {
        $(pub const $name: u32 = $code;)*

        /// Returns the message registered for `code`, or a generic fallback.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($name => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}
