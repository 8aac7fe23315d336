//! Bulk transfers against a remote origin over the in-process transport:
//! descriptor exchange by serialization, segmented RMA pull/push, bound
//! descriptors and cancellation of completed transfers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hermes::bulk::{self, BulkAccess, BulkHandle, BulkOpKind};
use hermes::na::mem::MemFabric;
use hermes::{Class, ClassOptions, Context, Error};

struct Net {
    // Nodes hold only a `Weak` to the fabric; keep the owning Arc alive for the
    // lifetime of the transports, as a real application would. Otherwise address
    // resolution fails with "fabric is gone".
    _fabric: Arc<MemFabric>,
    origin_class: Arc<Class>,
    origin_ctx: Arc<Context>,
    local_class: Arc<Class>,
    local_ctx: Arc<Context>,
}

fn setup(name: &str) -> Net {
    let fabric = MemFabric::new();
    let origin_transport = fabric.transport(&format!("{name}-origin")).unwrap();
    let origin_class = Class::new(origin_transport, ClassOptions::default()).unwrap();
    let origin_ctx = Context::create(&origin_class, 0).unwrap();

    let local_transport = fabric.transport(&format!("{name}-local")).unwrap();
    let local_class = Class::new(local_transport, ClassOptions::default()).unwrap();
    let local_ctx = Context::create(&local_class, 0).unwrap();

    Net {
        _fabric: fabric,
        origin_class,
        origin_ctx,
        local_class,
        local_ctx,
    }
}

/// Ships a descriptor between the two classes the way an RPC payload would.
fn exchange(net: &Net, handle: &Arc<BulkHandle>, eager: bool) -> Arc<BulkHandle> {
    let mut buf = vec![0u8; handle.serialize_size(eager)];
    handle.serialize(&mut buf, eager).unwrap();
    BulkHandle::deserialize(&net.local_class, &buf).unwrap()
}

fn drive(context: &Arc<Context>, until: impl Fn() -> bool) {
    for _ in 0..10_000 {
        match context.trigger(0, 16) {
            Ok(_) | Err(Error::Timeout) => {}
            Err(e) => panic!("trigger failed: {e}"),
        }
        match context.progress(0) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(e) => panic!("progress failed: {e}"),
        }
        if until() {
            return;
        }
    }
    panic!("test did not converge");
}

#[test]
fn pull_from_remote_origin() {
    let net = setup("pull");

    let origin = BulkHandle::create(&net.origin_class, &[40, 60, 28], BulkAccess::ReadOnly).unwrap();
    let data: Vec<u8> = (0..128).map(|i| i as u8).collect();
    origin.write(0, &data).unwrap();

    let remote_origin = exchange(&net, &origin, false);
    assert!(remote_origin.is_virtual());
    assert_eq!(remote_origin.total_size(), 128);

    let local = BulkHandle::create(&net.local_class, &[128], BulkAccess::ReadWrite).unwrap();
    let origin_addr = net.local_class.addr_lookup("pull-origin").unwrap();

    let done = Arc::new(AtomicU32::new(0));
    let done2 = Arc::clone(&done);
    let op = bulk::transfer(
        &net.local_ctx,
        BulkOpKind::Pull,
        &origin_addr,
        &remote_origin,
        8,
        &local,
        0,
        100,
        Box::new(move |info| {
            info.result.unwrap();
            done2.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    drive(&net.local_ctx, || done.load(Ordering::SeqCst) == 1);

    let mut out = vec![0u8; 100];
    local.read(0, &mut out).unwrap();
    assert_eq!(out, &data[8..108]);

    // Cancel after completion is a successful no-op.
    op.cancel().unwrap();

    drop((origin, remote_origin, local, origin_addr, op));
    net.local_ctx.destroy().unwrap();
    net.origin_ctx.destroy().unwrap();
}

#[test]
fn push_into_remote_origin() {
    let net = setup("push");

    let origin = BulkHandle::create(&net.origin_class, &[64, 64], BulkAccess::ReadWrite).unwrap();
    let remote_origin = exchange(&net, &origin, false);

    let local = BulkHandle::create(&net.local_class, &[32, 96], BulkAccess::ReadOnly).unwrap();
    let data = vec![0xabu8; 128];
    local.write(0, &data).unwrap();

    let origin_addr = net.local_class.addr_lookup("push-origin").unwrap();
    let done = Arc::new(AtomicU32::new(0));
    let done2 = Arc::clone(&done);
    bulk::transfer(
        &net.local_ctx,
        BulkOpKind::Push,
        &origin_addr,
        &remote_origin,
        0,
        &local,
        0,
        128,
        Box::new(move |info| {
            info.result.unwrap();
            done2.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    drive(&net.local_ctx, || done.load(Ordering::SeqCst) == 1);

    // The push landed in the origin's memory.
    let mut out = vec![0u8; 128];
    origin.read(0, &mut out).unwrap();
    assert_eq!(out, data);

    drop((origin, remote_origin, local, origin_addr));
    net.local_ctx.destroy().unwrap();
    net.origin_ctx.destroy().unwrap();
}

#[test]
fn per_segment_layouts_split_into_sub_operations() {
    let net = setup("pieces");

    // More segments than the transport can fold into one registration, so
    // the engine must issue one aligned sub-operation per segment pair.
    let lengths = vec![10usize; 18];
    let origin = BulkHandle::create(&net.origin_class, &lengths, BulkAccess::ReadOnly).unwrap();
    let data: Vec<u8> = (0..180).map(|i| (i % 251) as u8).collect();
    origin.write(0, &data).unwrap();

    let remote_origin = exchange(&net, &origin, false);
    let local = BulkHandle::create(&net.local_class, &[180], BulkAccess::ReadWrite).unwrap();
    let origin_addr = net.local_class.addr_lookup("pieces-origin").unwrap();

    let done = Arc::new(AtomicU32::new(0));
    let done2 = Arc::clone(&done);
    let op = bulk::transfer(
        &net.local_ctx,
        BulkOpKind::Pull,
        &origin_addr,
        &remote_origin,
        0,
        &local,
        0,
        180,
        Box::new(move |info| {
            info.result.unwrap();
            done2.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();
    assert_eq!(op.sub_op_count(), 18);

    drive(&net.local_ctx, || done.load(Ordering::SeqCst) == 1);

    let mut out = vec![0u8; 180];
    local.read(0, &mut out).unwrap();
    assert_eq!(out, data);

    drop((origin, remote_origin, local, origin_addr, op));
    net.local_ctx.destroy().unwrap();
    net.origin_ctx.destroy().unwrap();
}

#[test]
fn bind_transfer_uses_embedded_address() {
    let net = setup("bind");

    let origin = BulkHandle::create(&net.origin_class, &[96], BulkAccess::ReadOnly).unwrap();
    origin.bind(&net.origin_ctx).unwrap();
    let data: Vec<u8> = (0..96).map(|i| i as u8).collect();
    origin.write(0, &data).unwrap();

    let remote_origin = exchange(&net, &origin, false);
    // The bound address deserialized on the local side points at the origin
    // node, not at us.
    assert!(!remote_origin.bound_addr().unwrap().is_self());
    assert_eq!(remote_origin.bound_context_id(), Some(0));

    let local = BulkHandle::create(&net.local_class, &[96], BulkAccess::WriteOnly).unwrap();
    let done = Arc::new(AtomicU32::new(0));
    let done2 = Arc::clone(&done);
    bulk::bind_transfer(
        &net.local_ctx,
        BulkOpKind::Pull,
        &remote_origin,
        0,
        &local,
        0,
        96,
        Box::new(move |info| {
            info.result.unwrap();
            done2.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    drive(&net.local_ctx, || done.load(Ordering::SeqCst) == 1);

    let mut out = vec![0u8; 96];
    local.read(0, &mut out).unwrap();
    assert_eq!(out, data);

    // An unbound descriptor refuses bind_transfer.
    let unbound = BulkHandle::create(&net.local_class, &[8], BulkAccess::ReadOnly).unwrap();
    let l2 = BulkHandle::create(&net.local_class, &[8], BulkAccess::WriteOnly).unwrap();
    assert!(matches!(
        bulk::bind_transfer(
            &net.local_ctx,
            BulkOpKind::Pull,
            &unbound,
            0,
            &l2,
            0,
            8,
            Box::new(|_| panic!("callback must not fire")),
        ),
        Err(Error::InvalidArg(_))
    ));

    drop((origin, remote_origin, local, unbound, l2));
    net.local_ctx.destroy().unwrap();
    net.origin_ctx.destroy().unwrap();
}

#[test]
fn mismatched_bound_address_is_rejected() {
    let net = setup("mismatch");

    let origin = BulkHandle::create(&net.origin_class, &[16], BulkAccess::ReadOnly).unwrap();
    origin.bind(&net.origin_ctx).unwrap();
    let remote_origin = exchange(&net, &origin, false);

    let local = BulkHandle::create(&net.local_class, &[16], BulkAccess::WriteOnly).unwrap();
    // Deliberately the wrong origin address: our own.
    let wrong_addr = net.local_class.addr_self().unwrap();
    assert!(matches!(
        bulk::transfer(
            &net.local_ctx,
            BulkOpKind::Pull,
            &wrong_addr,
            &remote_origin,
            0,
            &local,
            0,
            16,
            Box::new(|_| panic!("callback must not fire")),
        ),
        Err(Error::InvalidArg(_))
    ));

    drop((origin, remote_origin, local, wrong_addr));
    net.local_ctx.destroy().unwrap();
    net.origin_ctx.destroy().unwrap();
}
