use std::{cell::RefCell, rc::Rc};

use assert_call::{call, CallRecorder};
use rstest::rstest;

use crate::{
    core::Runtime, test_helpers::call_on_drop, Destroyable, InvalidCleanupRegistration,
    ResourceError, State,
};

use super::*;

#[test]
fn evaluate_on_first_read() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let r = Resource::new(&owner, |_| {
        call!("eval");
        10
    });
    cr.verify(());
    assert_eq!(r.evaluations(), 0);
    assert_eq!(*r.get(&mut rt.sc()).unwrap(), 10);
    cr.verify("eval");
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(10)]
fn reads_without_change_return_same_rc(#[case] reads: usize) {
    let mut rt = Runtime::new();
    let owner = Destroyable::new();
    let s = State::new(1);
    let r = Resource::new(&owner, {
        let s = s.clone();
        move |cx| s.get(cx.sc())
    });
    let first = r.get(&mut rt.sc()).unwrap();
    for _ in 0..reads {
        let value = r.get(&mut rt.sc()).unwrap();
        assert!(Rc::ptr_eq(&first, &value));
    }
    assert_eq!(r.evaluations(), 1);
}

#[test]
fn one_evaluation_per_stale_read() {
    let mut rt = Runtime::new();
    let owner = Destroyable::new();
    let s = State::new(1);
    let r = Resource::new(&owner, {
        let s = s.clone();
        move |cx| s.get(cx.sc())
    });
    r.get(&mut rt.sc());
    s.set(2, rt.ac());
    s.set(3, rt.ac());
    assert_eq!(r.evaluations(), 1);
    assert_eq!(*r.get(&mut rt.sc()).unwrap(), 3);
    assert_eq!(*r.get(&mut rt.sc()).unwrap(), 3);
    assert_eq!(r.evaluations(), 2);
}

#[test]
fn cleanup_runs_before_next_evaluation() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let s = State::new(1);
    let r = Resource::new(&owner, {
        let s = s.clone();
        move |cx| {
            let value = s.get(cx.sc());
            call!("eval {value}");
            cx.on_cleanup(move || call!("cleanup {value}"));
            value
        }
    });
    r.get(&mut rt.sc());
    cr.verify("eval 1");

    s.set(2, rt.ac());
    cr.verify(());
    r.get(&mut rt.sc());
    cr.verify(["cleanup 1", "eval 2"]);

    owner.destroy();
    cr.verify("cleanup 2");
}

#[test]
fn cleanups_run_in_reverse_registration_order() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let r = Resource::new(&owner, |cx| {
        cx.on_cleanup(|| call!("a"));
        cx.on_cleanup(|| call!("b"));
        cx.on_cleanup(|| call!("c"));
    });
    r.get(&mut rt.sc());
    r.destroy();
    cr.verify(["c", "b", "a"]);
}

#[test]
fn destroy_is_idempotent() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let r = Resource::new(&owner, |cx| cx.on_cleanup(|| call!("cleanup")));
    r.get(&mut rt.sc());
    r.destroy();
    cr.verify("cleanup");
    r.destroy();
    owner.destroy();
    cr.verify(());
    assert!(r.is_destroyed());
}

#[test]
fn read_destroyed() {
    let mut rt = Runtime::new();
    let owner = Destroyable::new();
    let r = Resource::new(&owner, |_| 1);
    r.get(&mut rt.sc());
    owner.destroy();
    assert!(r.is_destroyed());
    assert_eq!(r.current(&mut rt.sc()), Err(ResourceError::Destroyed));
    assert!(r.current(&mut rt.sc()).unwrap_err().is_destroyed());
    assert_eq!(r.get(&mut rt.sc()), None);
}

#[test]
fn read_created_on_destroyed_owner() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    owner.destroy();
    let r = Resource::new(&owner, |_| call!("eval"));
    assert!(r.is_destroyed());
    assert_eq!(r.get(&mut rt.sc()), None);
    cr.verify(());
}

#[test]
fn drop_handle_destroys() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let r = Resource::new(&owner, |cx| cx.on_cleanup(|| call!("cleanup")));
    r.get(&mut rt.sc());
    assert_eq!(owner.children_len(), 1);
    drop(r);
    cr.verify("cleanup");
    assert_eq!(owner.children_len(), 0);
}

#[test]
fn superseded_value_is_dropped() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let s = State::new(0);
    let r = Resource::new(&owner, {
        let s = s.clone();
        move |cx| {
            s.get(cx.sc());
            call_on_drop("drop value")
        }
    });
    r.get(&mut rt.sc());
    s.set(1, rt.ac());
    r.get(&mut rt.sc());
    cr.verify("drop value");
    r.destroy();
    cr.verify("drop value");
}

#[test]
fn error_propagates_and_is_not_cached() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let s = State::new(-1);
    let r = Resource::try_new(&owner, {
        let s = s.clone();
        move |cx| {
            let value = s.get(cx.sc());
            call!("eval {value}");
            cx.on_cleanup(move || call!("cleanup {value}"));
            if value < 0 {
                Err("negative")
            } else {
                Ok(value)
            }
        }
    });
    assert_eq!(
        r.current(&mut rt.sc()),
        Err(ResourceError::Evaluation("negative"))
    );
    cr.verify(["eval -1", "cleanup -1"]);

    assert!(r.current(&mut rt.sc()).is_err());
    cr.verify(["eval -1", "cleanup -1"]);

    s.set(3, rt.ac());
    assert_eq!(*r.current(&mut rt.sc()).unwrap(), 3);
    cr.verify("eval 3");

    s.set(-2, rt.ac());
    assert!(r.current(&mut rt.sc()).is_err());
    cr.verify(["cleanup 3", "eval -2", "cleanup -2"]);
}

#[test]
fn on_cleanup_after_evaluation_is_rejected() {
    let mut rt = Runtime::new();
    let owner = Destroyable::new();
    let hooks = Rc::new(RefCell::new(None));
    let r = Resource::new(&owner, {
        let hooks = hooks.clone();
        move |cx| {
            assert!(cx.hooks().is_active());
            *hooks.borrow_mut() = Some(cx.hooks());
        }
    });
    r.get(&mut rt.sc());
    let hooks = hooks.borrow_mut().take().unwrap();
    assert!(!hooks.is_active());
    assert_eq!(
        hooks.try_on_cleanup(|| {}),
        Err(InvalidCleanupRegistration {})
    );
}

#[test]
#[should_panic(expected = "`on_cleanup` called outside of an active resource evaluation")]
fn on_cleanup_after_evaluation_panic() {
    let mut rt = Runtime::new();
    let owner = Destroyable::new();
    let hooks = Rc::new(RefCell::new(None));
    let r = Resource::new(&owner, {
        let hooks = hooks.clone();
        move |cx| *hooks.borrow_mut() = Some(cx.hooks())
    });
    r.get(&mut rt.sc());
    let hooks = hooks.borrow_mut().take().unwrap();
    hooks.on_cleanup(|| {});
}

#[test]
fn invocation_owner_is_destroyed_on_rerun() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let s = State::new(0);
    let r = Resource::new(&owner, {
        let s = s.clone();
        move |cx| {
            let value = s.get(cx.sc());
            let child = Destroyable::new();
            child.register_destructor(move || call!("child {value}"));
            cx.owner().associate_child(&child);
        }
    });
    r.get(&mut rt.sc());
    cr.verify(());
    s.set(1, rt.ac());
    r.get(&mut rt.sc());
    cr.verify("child 0");
    owner.destroy();
    cr.verify("child 1");
}

#[test]
fn thunk_is_called_once_per_evaluation() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let r = Resource::from_produced(&owner, |_| {
        call!("eval");
        Ok::<_, ()>(Produced::thunk(|| {
            call!("thunk");
            5
        }))
    });
    assert_eq!(*r.current(&mut rt.sc()).unwrap(), 5);
    cr.verify(["eval", "thunk"]);
    assert_eq!(*r.current(&mut rt.sc()).unwrap(), 5);
    cr.verify(());
}

#[test]
fn shared_value_does_not_invalidate_dependents() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let s = State::new(1);
    let even = Rc::new(true);
    let odd = Rc::new(false);
    let parity = Resource::from_produced(&owner, {
        let s = s.clone();
        move |cx| {
            let value = if s.get(cx.sc()) % 2 == 0 { &even } else { &odd };
            Ok::<_, ()>(Produced::Shared(value.clone()))
        }
    });
    let label = Resource::new(&owner, {
        let parity = parity.clone();
        move |cx| {
            let is_even = *parity.current(cx.sc()).unwrap();
            call!("label {is_even}");
            is_even
        }
    });
    label.get(&mut rt.sc());
    cr.verify("label false");

    s.set(3, rt.ac());
    label.get(&mut rt.sc());
    cr.verify(());
    assert_eq!(parity.evaluations(), 2);

    s.set(4, rt.ac());
    label.get(&mut rt.sc());
    cr.verify("label true");
}

#[test]
fn nested_resources_follow_upstream() {
    let mut rt = Runtime::new();
    let owner = Destroyable::new();
    let s = State::new(2);
    let double = Resource::new(&owner, {
        let s = s.clone();
        move |cx| s.get(cx.sc()) * 2
    });
    let plus_one = Resource::new(&owner, {
        let double = double.clone();
        move |cx| double.get(cx.sc()).map_or(0, |v| *v + 1)
    });
    assert_eq!(*plus_one.get(&mut rt.sc()).unwrap(), 5);
    s.set(5, rt.ac());
    assert_eq!(*plus_one.get(&mut rt.sc()).unwrap(), 11);
    assert_eq!(double.evaluations(), 2);
    assert_eq!(plus_one.evaluations(), 2);
}

#[test]
fn chained_resources_evaluate_once_per_stale_read() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let s = State::new(1);
    let a = Resource::new(&owner, {
        let s = s.clone();
        move |cx| {
            let value = s.get(cx.sc());
            call!("a {value}");
            value
        }
    });
    let b = Resource::new(&owner, {
        let a = a.clone();
        move |cx| {
            let value = a.get(cx.sc()).map_or(0, |v| *v * 10);
            call!("b {value}");
            value
        }
    });
    let c = Resource::new(&owner, {
        let b = b.clone();
        move |cx| {
            let value = b.get(cx.sc()).map_or(0, |v| *v + 1);
            call!("c {value}");
            value
        }
    });
    assert_eq!(*c.get(&mut rt.sc()).unwrap(), 11);
    cr.verify(["a 1", "b 10", "c 11"]);

    s.set(2, rt.ac());
    assert_eq!(*c.get(&mut rt.sc()).unwrap(), 21);
    cr.verify(["a 2", "b 20", "c 21"]);

    c.get(&mut rt.sc());
    b.get(&mut rt.sc());
    a.get(&mut rt.sc());
    cr.verify(());
    assert_eq!(a.evaluations(), 2);
    assert_eq!(b.evaluations(), 2);
    assert_eq!(c.evaluations(), 2);
}

#[test]
fn failing_upstream_evaluates_once_per_stale_read() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let s = State::new(1);
    let a = Resource::try_new(&owner, {
        let s = s.clone();
        move |cx| {
            let value = s.get(cx.sc());
            call!("a {value}");
            if value < 0 {
                Err("negative")
            } else {
                Ok(value)
            }
        }
    });
    let b = Resource::new(&owner, {
        let a = a.clone();
        move |cx| {
            call!("b");
            a.current(cx.sc()).map(|v| *v)
        }
    });
    assert_eq!(*b.get(&mut rt.sc()).unwrap(), Ok(1));
    cr.verify(["a 1", "b"]);

    s.set(-1, rt.ac());
    assert_eq!(
        *b.get(&mut rt.sc()).unwrap(),
        Err(ResourceError::Evaluation("negative"))
    );
    cr.verify(["a -1", "b"]);
    assert_eq!(a.evaluations(), 2);

    b.get(&mut rt.sc());
    cr.verify(());

    s.set(2, rt.ac());
    assert_eq!(*b.get(&mut rt.sc()).unwrap(), Ok(2));
    cr.verify(["a 2", "b"]);
    assert_eq!(a.evaluations(), 3);
}

#[test]
fn failure_found_by_staleness_check_is_returned_by_next_read() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let s = State::new(1);
    let a = Resource::try_new(&owner, {
        let s = s.clone();
        move |cx| {
            let value = s.get(cx.sc());
            call!("a {value}");
            if value < 0 {
                Err("negative")
            } else {
                Ok(value)
            }
        }
    });
    let (value, deps) = rt.run_tracked(|sc| a.current(sc).map(|v| *v));
    assert_eq!(value, Ok(1));
    cr.verify("a 1");

    s.set(-1, rt.ac());
    assert!(deps.is_stale(&mut rt.sc()));
    cr.verify("a -1");
    assert_eq!(
        a.current(&mut rt.sc()),
        Err(ResourceError::Evaluation("negative"))
    );
    cr.verify(());
    assert_eq!(a.evaluations(), 2);
}

#[test]
fn untracked_read_does_not_entangle() {
    let mut rt = Runtime::new();
    let owner = Destroyable::new();
    let s = State::new(1);
    let inner = Resource::new(&owner, {
        let s = s.clone();
        move |cx| s.get(cx.sc())
    });
    let outer = Resource::new(&owner, {
        let inner = inner.clone();
        move |cx| *inner.current_untracked(cx.sc()).unwrap()
    });
    assert_eq!(*outer.get(&mut rt.sc()).unwrap(), 1);
    s.set(2, rt.ac());
    assert_eq!(*outer.get(&mut rt.sc()).unwrap(), 1);
    assert_eq!(outer.evaluations(), 1);
}

#[test]
fn count_scenario() {
    #[derive(Debug, PartialEq)]
    struct Count {
        count: i32,
    }

    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let owner = Destroyable::new();
    let dep = State::new(1);
    let r = Resource::new(&owner, {
        let dep = dep.clone();
        move |cx| {
            let count = dep.get(cx.sc());
            cx.on_cleanup(move || call!("cleanup {count}"));
            Count { count }
        }
    });
    assert_eq!(*r.get(&mut rt.sc()).unwrap(), Count { count: 1 });
    dep.set(2, rt.ac());
    assert_eq!(*r.get(&mut rt.sc()).unwrap(), Count { count: 2 });
    cr.verify("cleanup 1");
}
