/// Builds the argument vector for a remote call from `Into<Arg>` values.
///
/// ```ignore
/// let result = proxy.call("add", args![1, 2]).await?;
/// ```
///
/// Callables and emitter pairs are built explicitly with
/// [`Arg::callback`](crate::Arg::callback) and
/// [`Arg::emitter`](crate::Arg::emitter).
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::Arg>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Arg::from($arg)),+]
    };
}
