mod common;

use common::vmm;
use kernel_alloc::FramePolicy;
use kernel_vmem::Processor;
use kernel_vmm::TypedMapping;

#[test]
fn a_typed_mapping_in_another_space_is_readable_inside_its_scope() {
    let vmm = vmm(16);
    let space_a = vmm.create_address_space().unwrap();
    let space_b = vmm.create_address_space().unwrap();
    let frame = vmm.frames().allocate(FramePolicy::Any).unwrap();
    frame.write_bytes(vmm.platform(), 0x10, &0xDEAD_BEEF_u32.to_le_bytes());

    let outer = vmm.enter(&space_a);
    assert_eq!(vmm.platform().active_root(), space_a.root());
    {
        let value = TypedMapping::<u32, _>::map_readonly(&vmm, &space_b, frame.address() + 0x10).unwrap();
        let scope = vmm.enter(&space_b);
        assert_eq!(vmm.platform().active_root(), space_b.root());
        assert_eq!(*value.get(), 0xDEAD_BEEF);
        drop(scope);
        assert_eq!(vmm.platform().active_root(), space_a.root());
    }
    drop(outer);
    assert_eq!(vmm.platform().active_root(), vmm.platform().kernel_root());

    space_a.destroy(&vmm).unwrap();
    space_b.destroy(&vmm).unwrap();
}

#[test]
#[should_panic(expected = "not mapped in the active address space")]
fn the_mapping_is_not_visible_outside_its_space() {
    let vmm = vmm(16);
    let space = vmm.create_address_space().unwrap();
    let frame = vmm.frames().allocate(FramePolicy::Any).unwrap();
    let value = TypedMapping::<u32, _>::map_readonly(&vmm, &space, frame.address()).unwrap();
    let _ = *value.get();
}

#[test]
fn scopes_nest_and_pin_the_processor() {
    let vmm = vmm(8);
    let a = vmm.create_address_space().unwrap();
    let b = vmm.create_address_space().unwrap();
    let kernel = vmm.platform().kernel_root();
    assert_eq!(vmm.platform().pin_depth(), 0);

    {
        let outer = vmm.enter(&a);
        assert_eq!(outer.previous_root(), kernel);
        assert_eq!(vmm.platform().pin_depth(), 1);
        {
            let inner = vmm.enter(&b);
            assert_eq!(inner.previous_root(), a.root());
            assert_eq!(inner.root(), b.root());
            assert_eq!(vmm.platform().active_root(), b.root());
            assert_eq!(vmm.platform().pin_depth(), 2);
        }
        assert_eq!(vmm.platform().active_root(), a.root());
        assert_eq!(vmm.platform().pin_depth(), 1);
    }
    assert_eq!(vmm.platform().active_root(), kernel);
    assert_eq!(vmm.platform().pin_depth(), 0);

    a.destroy(&vmm).unwrap();
    b.destroy(&vmm).unwrap();
}

#[test]
fn entering_the_active_space_does_not_reload_it() {
    let vmm = vmm(8);
    let installs = vmm.platform().installs();
    let scope = vmm.enter(vmm.kernel_space());
    assert_eq!(vmm.platform().installs(), installs);
    assert_eq!(vmm.platform().pin_depth(), 1);
    drop(scope);
    assert_eq!(vmm.platform().installs(), installs);
    assert_eq!(vmm.platform().pin_depth(), 0);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "reverse order of entry")]
fn scopes_left_out_of_order_are_caught() {
    let vmm = vmm(8);
    let a = vmm.create_address_space().unwrap();
    let b = vmm.create_address_space().unwrap();
    let outer = vmm.enter(&a);
    let _inner = vmm.enter(&b);
    drop(outer);
}
