/// A macro to generate a test that works on a fresh named-pipe path.
///
/// Tracing is initialized first. The path is unique to the test and whatever gets created there is
/// removed when the test body returns.
///
/// # Example
///
/// ```no_run
/// use pipekit_test_utils::*;
/// pipetest!(creates_fifo, |path| {
///     std::fs::write(path.path(), b"").unwrap();
///     assert!(path.path().exists());
/// });
/// ```
#[macro_export]
macro_rules! pipetest {
    ($(#[$attr:meta])* $test:ident, |$path:ident| $e:expr) => {
        #[test]
        $(#[$attr])*
        fn $test() {
            $crate::init_tracing();
            let $path = $crate::PipePath::new();
            $e
        }
    };
}
