use std::time::{Duration, Instant};

pub mod bmp;
pub mod env;
pub mod machine;

#[allow(unused)]
pub fn enable_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `condition` until it holds; panics after a generous timeout.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "Condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn expect_error_message<T: std::fmt::Debug>(result: crate::Result<T>, msg: &str) {
    match result {
        Ok(value) => panic!("Expected error, got Ok({value:?})"),
        Err(error) => {
            let formatted = error.to_string();
            if !formatted.contains(msg) {
                panic!("Did not find `{msg}` in `{formatted}`");
            }
        }
    }
}
