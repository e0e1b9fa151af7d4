//! Signal routing. Kept in its own test binary so the handlers it installs
//! cannot affect other tests.

use std::thread;
use std::time::{Duration, Instant};

use nbagent::io::interrupt::{InterruptToken, install_signal_handlers};
use signal_hook::consts::SIGTERM;
use signal_hook::low_level::raise;

#[test]
fn sigterm_sets_the_interrupt_token() {
    let token = InterruptToken::new();
    let guard = install_signal_handlers(token.clone()).expect("install handlers");

    raise(SIGTERM).expect("raise SIGTERM");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !token.is_set() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(token.is_set());
    drop(guard);
}
