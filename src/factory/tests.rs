use std::{rc::Rc, sync::Arc};

use assert_call::{call, CallRecorder};
use rstest::rstest;

use crate::{core::Runtime, Destroyable, Resource, ResourceError, State};

use super::*;

fn counter_factory() -> ResourceFactory<(i32,), i32> {
    resource_factory(|&(x,): &(i32,), cx| {
        call!("create {x}");
        cx.on_cleanup(move || call!("cleanup {x}"));
        x * 10
    })
}

#[test]
fn same_call_site_and_args_returns_same_resource() {
    let _rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let f = counter_factory();
    let owner = Destroyable::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(f.call(&owner, (1,)));
    }
    assert!(Resource::ptr_eq(&handles[0], &handles[1]));
    assert!(Resource::ptr_eq(&handles[0], &handles[2]));
    assert_eq!(f.len(), 1);
    cr.verify(());
}

#[test]
fn different_call_sites_are_different_resources() {
    let _rt = Runtime::new();
    let f = counter_factory();
    let owner = Destroyable::new();
    let r0 = f.call(&owner, (1,));
    let r1 = f.call(&owner, (1,));
    assert!(!Resource::ptr_eq(&r0, &r1));
    assert_eq!(f.len(), 2);
}

#[test]
fn different_owners_are_different_resources() {
    let _rt = Runtime::new();
    let f = counter_factory();
    let owners = [Destroyable::new(), Destroyable::new()];
    let rs: Vec<_> = owners.iter().map(|owner| f.call(owner, (1,))).collect();
    assert!(!Resource::ptr_eq(&rs[0], &rs[1]));
    assert_eq!(f.len(), 2);
}

#[test]
fn changed_args_replace_resource() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let f = counter_factory();
    let owner = Destroyable::new();
    let mut handles = Vec::new();
    for x in [1, 1, 2] {
        let r = f.call(&owner, (x,));
        assert_eq!(*r.get(&mut rt.sc()).unwrap(), x * 10);
        handles.push(r);
    }
    cr.verify(["create 1", "cleanup 1", "create 2"]);
    assert!(Resource::ptr_eq(&handles[0], &handles[1]));
    assert!(handles[0].is_destroyed());
    assert!(!handles[2].is_destroyed());
    assert_eq!(f.len(), 1);
}

#[test]
fn destroy_owner_destroys_and_forgets_resources() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let f = counter_factory();
    let owner = Destroyable::new();
    let r = f.call(&owner, (3,));
    r.get(&mut rt.sc());
    cr.verify("create 3");
    assert_eq!(f.len(), 1);

    owner.destroy();
    cr.verify("cleanup 3");
    assert!(r.is_destroyed());
    assert!(f.is_empty());
}

#[test]
fn drop_owner_destroys_and_forgets_resources() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let f = counter_factory();
    let owner = Destroyable::new();
    let r = f.call(&owner, (4,));
    r.get(&mut rt.sc());
    cr.verify("create 4");

    drop(owner);
    cr.verify("cleanup 4");
    assert!(r.is_destroyed());
    assert!(f.is_empty());
}

#[test]
fn destroyed_resource_is_recreated() {
    let _rt = Runtime::new();
    let f = counter_factory();
    let owner = Destroyable::new();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let r = f.call(&owner, (1,));
        r.destroy();
        handles.push(r);
    }
    assert!(!Resource::ptr_eq(&handles[0], &handles[1]));
    assert!(f.is_empty());
}

#[test]
fn call_on_destroyed_owner_returns_destroyed_resource() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let f = counter_factory();
    let owner = Destroyable::new();
    owner.destroy();
    let r = f.call(&owner, (1,));
    assert!(r.is_destroyed());
    assert_eq!(r.current(&mut rt.sc()), Err(ResourceError::Destroyed));
    assert!(f.is_empty());
    cr.verify(());
}

#[test]
fn rc_args_compare_by_identity() {
    let _rt = Runtime::new();
    let f = resource_factory(|args: &(Rc<String>,), _| args.0.len());
    let owner = Destroyable::new();
    let a = Rc::new("abc".to_string());
    let b = Rc::new("abc".to_string());
    let mut handles = Vec::new();
    for arg in [&a, &a, &b] {
        handles.push(f.call(&owner, (arg.clone(),)));
    }
    assert!(Resource::ptr_eq(&handles[0], &handles[1]));
    assert!(!Resource::ptr_eq(&handles[1], &handles[2]));
}

#[test]
fn fallible_factory() {
    let mut rt = Runtime::new();
    let f = try_resource_factory(|&(x,): &(i32,), _| if x < 0 { Err("negative") } else { Ok(x) });
    let owner = Destroyable::new();
    let r = f.call(&owner, (-1,));
    assert_eq!(
        r.current(&mut rt.sc()),
        Err(ResourceError::Evaluation("negative"))
    );
}

#[test]
fn factory_resources_track_dependencies() {
    let mut rt = Runtime::new();
    let s = State::new(1);
    let f = resource_factory(|(s, k): &(State<i32>, i32), cx| s.get(cx.sc()) * k);
    let owner = Destroyable::new();
    let r = f.call(&owner, (s.clone(), 3));
    assert_eq!(*r.get(&mut rt.sc()).unwrap(), 3);
    s.set(2, rt.ac());
    assert_eq!(*r.get(&mut rt.sc()).unwrap(), 6);
}

#[rstest]
#[case(1, 1, true)]
#[case(1, 2, false)]
fn shallow_eq_primitive(#[case] a: i32, #[case] b: i32, #[case] expected: bool) {
    assert_eq!(a.shallow_eq(&b), expected);
}

#[rstest]
#[case("a", "a", true)]
#[case("a", "b", false)]
fn shallow_eq_str(#[case] a: &'static str, #[case] b: &'static str, #[case] expected: bool) {
    assert_eq!(a.shallow_eq(&b), expected);
    assert_eq!(a.to_string().shallow_eq(&b.to_string()), expected);
}

#[test]
fn shallow_eq_shared_by_identity() {
    let a = Arc::new(1);
    assert!(a.shallow_eq(&a.clone()));
    assert!(!a.shallow_eq(&Arc::new(1)));

    let s = State::new(1);
    assert!(s.shallow_eq(&s.clone()));
    assert!(!s.shallow_eq(&State::new(1)));
}

#[test]
fn shallow_eq_collections() {
    let a = Rc::new(1);
    assert!(vec![a.clone()].shallow_eq(&vec![a.clone()]));
    assert!(!vec![a.clone()].shallow_eq(&vec![Rc::new(1)]));
    assert!(!vec![1i32].shallow_eq(&vec![1, 2]));
    assert!(Some(1i32).shallow_eq(&Some(1)));
    assert!(!Some(1i32).shallow_eq(&None));
    assert!([1i32, 2].shallow_eq(&[1, 2]));
    assert!((1i32, "a", 2.0f64).shallow_eq(&(1, "a", 2.0)));
    assert!(!(1i32, "a").shallow_eq(&(1, "b")));
}
