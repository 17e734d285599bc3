///////////////////
// Vector macros //
///////////////////

/// Assertion that all vectors have the same length.
#[macro_export]
macro_rules! assert_same_len {
    ($($vec:expr),+ $(,)?) => {
        {
            let lengths: Vec<usize> = vec![$($vec.len()),+];
            let first_len = lengths[0];

            if !lengths.iter().all(|&len| len == first_len) {
                panic!(
                    "Vectors have different lengths: {:?}",
                    lengths
                );
            }
        }
    };
}

/// Early return with an `HsneError::InvalidArgument` if the lengths differ.
///
/// Fallible counterpart of `assert_same_len!` for public entry points.
#[macro_export]
macro_rules! ensure_same_len {
    ($($vec:expr),+ $(,)?) => {
        {
            let lengths: Vec<usize> = vec![$($vec.len()),+];
            let first_len = lengths[0];

            if !lengths.iter().all(|&len| len == first_len) {
                return Err($crate::error::HsneError::InvalidArgument(format!(
                    "Vectors have different lengths: {:?}",
                    lengths
                )));
            }
        }
    };
}

/////////////
// Logging //
/////////////

/// Progress message at `info` when `verbose` is set, at `debug` otherwise.
#[macro_export]
macro_rules! log_progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            log::info!($($arg)+);
        } else {
            log::debug!($($arg)+);
        }
    };
}
