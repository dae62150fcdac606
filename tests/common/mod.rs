pub use flowdag_test_utils::{init_tracing, with_timeout};
