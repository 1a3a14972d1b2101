//! Timer repeat/cancel semantics, run entirely on one thread since timer
//! callbacks carry no `Send` bound.

use std::cell::RefCell;
use std::rc::Rc;

use reactor::{EventLoop, TimerId};

#[test]
fn timer_repeats_and_cancels_after_exactly_three_fires() {
    let event_loop = Rc::new(EventLoop::new().unwrap());
    let counter = Rc::new(RefCell::new(0u32));
    let timer_id: Rc<RefCell<Option<TimerId>>> = Rc::new(RefCell::new(None));

    let loop_for_cb = event_loop.clone();
    let counter_for_cb = counter.clone();
    let timer_id_for_cb = timer_id.clone();
    let handle = event_loop.handle();

    let id = event_loop.run_every(0.001, move || {
        *counter_for_cb.borrow_mut() += 1;
        if *counter_for_cb.borrow() == 3 {
            if let Some(id) = *timer_id_for_cb.borrow() {
                loop_for_cb.cancel_timer(id);
            }
            handle.quit();
        }
    });
    *timer_id.borrow_mut() = Some(id);

    event_loop.run();
    assert_eq!(*counter.borrow(), 3);
}

#[test]
fn cancelled_timer_never_fires() {
    let event_loop = Rc::new(EventLoop::new().unwrap());
    let fired = Rc::new(RefCell::new(false));

    let fired_for_cb = fired.clone();
    let id = event_loop.run_after(0.05, move || {
        *fired_for_cb.borrow_mut() = true;
    });
    event_loop.cancel_timer(id);

    let handle = event_loop.handle();
    event_loop.run_after(0.01, move || handle.quit());
    event_loop.run();

    assert!(!*fired.borrow());
}
