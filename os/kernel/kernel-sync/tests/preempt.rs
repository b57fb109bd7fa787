use kernel_sync::PreemptCounter;
use std::panic;

#[test]
fn pins_nest_and_unwind() {
    let counter = PreemptCounter::new();
    assert!(!counter.is_pinned());

    let outer = counter.pin();
    {
        let _inner = counter.pin();
        assert_eq!(counter.depth(), 2);
    }
    assert_eq!(counter.depth(), 1);
    drop(outer);
    assert!(!counter.is_pinned());
}

#[test]
fn pin_is_released_on_panic() {
    let counter = PreemptCounter::new();
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let _pin = counter.pin();
        panic!("fault while pinned");
    }));
    assert!(res.is_err());
    assert_eq!(counter.depth(), 0);
}
