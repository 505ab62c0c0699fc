//! End-to-end submission scenarios across lists, queues, fences and events.

use std::sync::Arc;
use std::time::Duration;

use ember_core::{
    AccessTier, Context, FnKernel, GroupCount, Image, ImageDesc, ImageRegion, KernelArgs, KernelHandle,
    LaunchContext, WaitResult, WaitTimeout, GROUP_COUNT_SIZE,
};
use ember_hal::{DeviceId, Driver, DriverConfig, Error, GpuAddr, IpcHandle};
use ember_sync::{EventDesc, EventPool, EventPoolDesc, EventPoolFlags, EventStatus};

use crate::{
    Command, CommandList, CommandListDesc, CommandListFlags, CommandQueue, CommandQueueDesc,
    CommandQueueFlags, Fence, FenceStatus, ImageCopy, IndirectLaunch, QueueMode,
};

fn context() -> Arc<Context> {
    Context::new(Driver::new(DriverConfig::default()).unwrap())
}

fn queue(ctx: &Arc<Context>) -> CommandQueue {
    CommandQueue::create(ctx, DeviceId(0), CommandQueueDesc::default()).unwrap()
}

fn list(ctx: &Arc<Context>) -> CommandList {
    CommandList::create(ctx, DeviceId(0), CommandListDesc::default()).unwrap()
}

fn bytes(ctx: &Context, addr: GpuAddr, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    ctx.read(addr, &mut out).unwrap();
    out
}

fn store_one() -> KernelHandle {
    FnKernel::new("store_one", |launch: &mut LaunchContext<'_>| {
        let out = launch.arg_buffer(0)?;
        launch.write_u32(out, 1)
    })
}

fn increment() -> KernelHandle {
    FnKernel::new("increment", |launch: &mut LaunchContext<'_>| {
        let out = launch.arg_buffer(0)?;
        let n = launch.read_u32(out)?;
        launch.write_u32(out, n + 1)
    })
}

fn atomic_increment() -> KernelHandle {
    FnKernel::new("atomic_increment", |launch: &mut LaunchContext<'_>| {
        let out = launch.arg_buffer(0)?;
        launch.atomic_add_u32(out, 1).map(|_| ())
    })
}

// =============================================================================
// LIST LIFECYCLE
// =============================================================================

#[test]
fn test_fill_is_repeatable_on_a_reused_list_and_queue() {
    let ctx = context();
    let queue = queue(&ctx);
    let list = list(&ctx);
    let buf = ctx.alloc_shared(DeviceId(0), 16).unwrap();
    list.append(Command::memory_fill(buf, 0x1, 16)).unwrap();
    list.close().unwrap();

    for _ in 0..5 {
        ctx.write(buf, &[0u8; 16]).unwrap();
        queue.execute_command_lists(&[&list], None).unwrap();
        assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
        assert_eq!(bytes(&ctx, buf, 16), vec![0x1; 16]);
    }
}

#[test]
fn test_append_after_close_has_no_effect() {
    let ctx = context();
    let queue = queue(&ctx);
    let list = list(&ctx);
    let buf = ctx.alloc_shared(DeviceId(0), 16).unwrap();
    list.append(Command::memory_fill(buf, 0x1, 16)).unwrap();
    list.close().unwrap();
    assert!(list.append(Command::memory_fill(buf, 0x2, 16)).is_ok());

    queue.execute_command_lists(&[&list], None).unwrap();
    assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&ctx, buf, 16), vec![0x1; 16]);
    assert_eq!(list.dropped_appends(), 1);
}

#[test]
fn test_reset_then_close_executes_nothing() {
    let ctx = context();
    let queue = queue(&ctx);
    let list = list(&ctx);
    let buf = ctx.alloc_host(16).unwrap();

    for n in 0..4u8 {
        for _ in 0..n {
            list.append(Command::memory_fill(buf, 0xFF, 16)).unwrap();
        }
        list.close().unwrap();
        queue.execute_command_lists(&[&list], None).unwrap();
        assert!(queue.synchronize(WaitTimeout::Infinite).is_success());

        list.reset().unwrap();
        list.close().unwrap();
        ctx.write(buf, &[0u8; 16]).unwrap();
        queue.execute_command_lists(&[&list], None).unwrap();
        assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
        assert_eq!(bytes(&ctx, buf, 16), vec![0u8; 16]);
        list.reset().unwrap();
    }
}

#[test]
fn test_reset_does_not_disturb_queued_work() {
    let ctx = context();
    let queue = queue(&ctx);
    let list = list(&ctx);
    let pool = EventPool::create(&ctx, EventPoolDesc::default()).unwrap();
    let gate = pool.create_event(EventDesc::default()).unwrap();
    let buf = ctx.alloc_host(4).unwrap();

    list.append(Command::memory_fill(buf, 0x1, 4).with_waits(&[gate.clone()]))
        .unwrap();
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None).unwrap();

    assert_eq!(list.in_flight(), 1);
    assert_eq!(list.destroy().unwrap_err(), Error::InvalidState);
    list.reset().unwrap();
    list.append(Command::memory_fill(buf, 0x2, 4)).unwrap();

    assert!(queue.synchronize(WaitTimeout::millis(5)).is_timeout());
    gate.signal();
    assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&ctx, buf, 4), vec![0x1; 4]);
    assert_eq!(list.in_flight(), 0);
    list.destroy().unwrap();
}

// =============================================================================
// FENCES AND ORDERING
// =============================================================================

#[test]
fn test_fence_signals_after_effects_are_visible() {
    let ctx = context();
    let queue = queue(&ctx);
    let list = list(&ctx);
    let out = ctx.alloc_host(4).unwrap();
    list.append(Command::launch_kernel(
        increment(),
        GroupCount::linear(8),
        KernelArgs::new().buffer(out),
    ))
    .unwrap();
    list.close().unwrap();

    let fence = Fence::create(&queue);
    queue.execute_command_lists(&[&list], Some(&fence)).unwrap();
    assert_eq!(fence.host_synchronize(WaitTimeout::Infinite), WaitResult::Success);
    assert_eq!(fence.query_status(), FenceStatus::Signaled);
    assert_eq!(bytes(&ctx, out, 4), 8u32.to_le_bytes().to_vec());

    // Rebinding needs a reset; the failed call leaves the list idle.
    assert_eq!(
        queue.execute_command_lists(&[&list], Some(&fence)).unwrap_err(),
        Error::InvalidState
    );
    assert_eq!(list.in_flight(), 0);

    fence.reset();
    assert_eq!(fence.query_status(), FenceStatus::NotReady);
    queue.execute_command_lists(&[&list], Some(&fence)).unwrap();
    assert!(fence.host_synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&ctx, out, 4), 16u32.to_le_bytes().to_vec());
}

#[test]
fn test_submissions_run_in_fifo_order() {
    let ctx = context();
    let queue = queue(&ctx);
    let buf = ctx.alloc_host(16).unwrap();
    let first = list(&ctx);
    first.append(Command::memory_fill(buf, 0xA, 16)).unwrap();
    first.close().unwrap();
    let second = list(&ctx);
    second.append(Command::memory_fill(buf, 0xB, 8)).unwrap();
    second.close().unwrap();

    queue.execute_command_lists(&[&first], None).unwrap();
    queue.execute_command_lists(&[&second], None).unwrap();
    assert!(queue.synchronize(WaitTimeout::Infinite).is_success());

    let out = bytes(&ctx, buf, 16);
    assert_eq!(&out[..8], &[0xB; 8]);
    assert_eq!(&out[8..], &[0xA; 8]);
}

#[test]
fn test_lists_in_one_submission_run_in_given_order() {
    let ctx = context();
    let queue = queue(&ctx);
    let a = ctx.alloc_host(8).unwrap();
    let b = ctx.alloc_host(8).unwrap();
    let fill = list(&ctx);
    fill.append(Command::memory_fill(a, 0x7, 8)).unwrap();
    fill.close().unwrap();
    let copy = list(&ctx);
    copy.append(Command::memory_copy(b, a, 8)).unwrap();
    copy.close().unwrap();

    queue.execute_command_lists(&[&fill, &copy], None).unwrap();
    assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&ctx, b, 8), vec![0x7; 8]);
}

#[test]
fn test_many_threads_share_one_queue() {
    const THREADS: usize = 16;
    let ctx = context();
    let queue = queue(&ctx);
    let buf = ctx.alloc_host(THREADS as u64 * 4).unwrap();

    std::thread::scope(|s| {
        for i in 0..THREADS {
            let ctx = &ctx;
            let queue = &queue;
            s.spawn(move || {
                let list = list(ctx);
                let slot = buf.offset(i as u64 * 4);
                list.append(Command::memory_fill(slot, i as u8, 4)).unwrap();
                list.close().unwrap();
                let fence = Fence::create(queue);
                queue.execute_command_lists(&[&list], Some(&fence)).unwrap();
                assert!(fence.host_synchronize(WaitTimeout::Infinite).is_success());
                list.destroy().unwrap();
            });
        }
    });

    let out = bytes(&ctx, buf, THREADS * 4);
    for (i, chunk) in out.chunks(4).enumerate() {
        assert_eq!(chunk, &[i as u8; 4]);
    }
    assert_eq!(queue.stats().submissions, THREADS as u64);
}

#[test]
fn test_dropping_a_queue_discards_pending_work() {
    let ctx = context();
    let pool = EventPool::create(&ctx, EventPoolDesc::default()).unwrap();
    let gate = pool.create_event(EventDesc::default()).unwrap();
    let blocked = list(&ctx);
    blocked.append(Command::wait_on_events(&[gate.clone()])).unwrap();
    blocked.close().unwrap();
    let behind = list(&ctx);
    behind.append(Command::barrier()).unwrap();
    behind.close().unwrap();

    let queue = queue(&ctx);
    let fence = Fence::create(&queue);
    queue.execute_command_lists(&[&blocked], None).unwrap();
    queue.execute_command_lists(&[&behind], Some(&fence)).unwrap();
    drop(queue);

    assert_eq!(fence.query_status(), FenceStatus::NotReady);
    assert_eq!(blocked.in_flight(), 0);
    assert_eq!(behind.in_flight(), 0);
    assert!(!gate.is_signaled());
}

// =============================================================================
// EVENTS
// =============================================================================

#[test]
fn test_immediate_async_list_waits_on_host_event() {
    let ctx = context();
    let list = CommandList::create_immediate(
        &ctx,
        DeviceId(0),
        CommandQueueDesc::default().with_mode(QueueMode::Asynchronous),
    )
    .unwrap();
    let pool = EventPool::create(&ctx, EventPoolDesc::default().with_count(2)).unwrap();
    let e1 = pool.create_event(EventDesc::default()).unwrap();
    let e2 = pool.create_event(EventDesc::default()).unwrap();
    let out = ctx.alloc_host(4).unwrap();

    list.append(Command::signal_event(&e1)).unwrap();
    list.append(Command::barrier()).unwrap();
    list.append(Command::wait_on_events(&[e2.clone()])).unwrap();
    list.append(Command::launch_kernel(
        store_one(),
        GroupCount::linear(1),
        KernelArgs::new().buffer(out),
    ))
    .unwrap();

    assert!(e1.host_synchronize(WaitTimeout::millis(1000)).is_success());
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(bytes(&ctx, out, 4), vec![0; 4]);
    assert_eq!(
        list.host_synchronize(WaitTimeout::millis(5)).unwrap(),
        WaitResult::Timeout
    );

    e2.signal();
    assert!(list.host_synchronize(WaitTimeout::Infinite).unwrap().is_success());
    assert_eq!(bytes(&ctx, out, 4), 1u32.to_le_bytes().to_vec());
}

#[test]
fn test_synchronous_immediate_list_completes_on_append() {
    let ctx = context();
    let list = CommandList::create_immediate(
        &ctx,
        DeviceId(0),
        CommandQueueDesc::default().with_mode(QueueMode::Synchronous),
    )
    .unwrap();
    let pool = EventPool::create(&ctx, EventPoolDesc::default()).unwrap();
    let done = pool.create_event(EventDesc::default()).unwrap();
    let buf = ctx.alloc_host(8).unwrap();

    list.append(Command::memory_fill(buf, 0x3, 8).with_signal(&done))
        .unwrap();
    assert_eq!(bytes(&ctx, buf, 8), vec![0x3; 8]);
    assert_eq!(done.query_status(), EventStatus::Signaled);
}

#[test]
fn test_queued_reset_applies_when_reached() {
    let ctx = context();
    let queue = queue(&ctx);
    let pool = EventPool::create(&ctx, EventPoolDesc::default().with_count(2)).unwrap();
    let gate = pool.create_event(EventDesc::default()).unwrap();
    let target = pool.create_event(EventDesc::default()).unwrap();
    target.signal();

    let list = list(&ctx);
    list.append(Command::wait_on_events(&[gate.clone()])).unwrap();
    list.append(Command::reset_event(&target)).unwrap();
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None).unwrap();

    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(target.query_status(), EventStatus::Signaled);
    gate.signal();
    assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(target.query_status(), EventStatus::NotReady);
}

#[test]
fn test_signal_event_marks_a_flush_point() {
    let ctx = context();
    let queue = queue(&ctx);
    let pool = EventPool::create(&ctx, EventPoolDesc::default()).unwrap();
    let flushed = pool.create_event(EventDesc::default()).unwrap();
    let src = ctx.alloc_host(32).unwrap();
    let dst = ctx.alloc_host(32).unwrap();
    ctx.write(src, &[0x42; 32]).unwrap();

    let list = list(&ctx);
    list.append(Command::memory_copy(dst, src, 32)).unwrap();
    list.append(Command::barrier().with_signal(&flushed)).unwrap();
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None).unwrap();

    assert!(flushed.host_synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&ctx, dst, 32), vec![0x42; 32]);
}

#[test]
fn test_device_fault_is_recorded_and_submission_completes() {
    let ctx = context();
    let queue = queue(&ctx);
    let pool = EventPool::create(&ctx, EventPoolDesc::default().with_count(2)).unwrap();
    let faulted = pool.create_event(EventDesc::default()).unwrap();
    let finished = pool.create_event(EventDesc::default()).unwrap();
    let doomed = ctx.alloc_host(16).unwrap();
    let kept = ctx.alloc_host(16).unwrap();

    let list = list(&ctx);
    list.append(Command::memory_fill(doomed, 1, 16).with_signal(&faulted))
        .unwrap();
    list.append(Command::memory_fill(kept, 2, 16).with_signal(&finished))
        .unwrap();
    list.close().unwrap();
    ctx.free(doomed).unwrap();

    let fence = Fence::create(&queue);
    queue.execute_command_lists(&[&list], Some(&fence)).unwrap();
    assert!(fence.host_synchronize(WaitTimeout::Infinite).is_success());

    assert_eq!(faulted.query_status(), EventStatus::NotReady);
    assert_eq!(finished.query_status(), EventStatus::Signaled);
    assert_eq!(bytes(&ctx, kept, 16), vec![2; 16]);
    let fault = queue.last_fault().unwrap();
    assert_eq!(fault.command, "MemoryFill");
    assert_eq!(fault.error, Error::InvalidGpuAddress);
    assert_eq!(queue.stats().faults, 1);
}

#[test]
fn test_system_barrier_waits_for_device_queues() {
    let ctx = context();
    let queue = queue(&ctx);
    let pool = EventPool::create(&ctx, EventPoolDesc::default()).unwrap();
    let gate = pool.create_event(EventDesc::default()).unwrap();
    let list = list(&ctx);
    list.append(Command::wait_on_events(&[gate.clone()])).unwrap();
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None).unwrap();

    assert_eq!(
        ctx.system_barrier(DeviceId(0), WaitTimeout::millis(10)).unwrap(),
        WaitResult::Timeout
    );
    gate.signal();
    assert_eq!(
        ctx.system_barrier(DeviceId(0), WaitTimeout::Infinite).unwrap(),
        WaitResult::Success
    );
}

// =============================================================================
// MULTI-DEVICE AND IPC
// =============================================================================

#[test]
fn test_peer_access_is_symmetric_and_enforced() {
    let config = DriverConfig::multi_device(2).without_peer_links();
    let ctx = Context::new(Driver::new(config).unwrap());
    let driver = ctx.driver();
    assert_eq!(
        driver.can_access_peer(DeviceId(0), DeviceId(1)).unwrap(),
        driver.can_access_peer(DeviceId(1), DeviceId(0)).unwrap()
    );

    let remote = ctx.alloc_device(DeviceId(1), 64).unwrap();
    let local = ctx.alloc_device(DeviceId(0), 64).unwrap();
    let list = list(&ctx);
    assert_eq!(
        list.append(Command::memory_copy(local, remote, 64)).unwrap_err(),
        Error::PeerAccessDenied
    );

    let scoped = EventPool::create(
        &ctx,
        EventPoolDesc::default().with_devices(&[DeviceId(1)]),
    )
    .unwrap();
    let event = scoped.create_event(EventDesc::default()).unwrap();
    assert_eq!(
        list.append(Command::signal_event(&event)).unwrap_err(),
        Error::PeerAccessDenied
    );
    assert!(list.is_empty());
}

#[test]
fn test_cross_device_event_orders_peer_copy() {
    let ctx = Context::new(Driver::new(DriverConfig::multi_device(2)).unwrap());
    let pool = EventPool::create(
        &ctx,
        EventPoolDesc::default().with_devices(&[DeviceId(0), DeviceId(1)]),
    )
    .unwrap();
    let produced = pool.create_event(EventDesc::default()).unwrap();
    let src = ctx.alloc_device(DeviceId(0), 64).unwrap();
    let out = ctx.alloc_host(64).unwrap();

    let q0 = CommandQueue::create(&ctx, DeviceId(0), CommandQueueDesc::default()).unwrap();
    let q1 = CommandQueue::create(&ctx, DeviceId(1), CommandQueueDesc::default()).unwrap();

    let consumer = CommandList::create(&ctx, DeviceId(1), CommandListDesc::default()).unwrap();
    consumer
        .append(Command::memory_copy(out, src, 64).with_waits(&[produced.clone()]))
        .unwrap();
    consumer.close().unwrap();
    let producer = list(&ctx);
    producer
        .append(Command::memory_fill(src, 0x9, 64).with_signal(&produced))
        .unwrap();
    producer.close().unwrap();

    q1.execute_command_lists(&[&consumer], None).unwrap();
    q0.execute_command_lists(&[&producer], None).unwrap();
    assert!(q1.synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&ctx, out, 64), vec![0x9; 64]);

    // Lists cannot be submitted to a queue of another device.
    assert_eq!(
        q0.execute_command_lists(&[&consumer], None).unwrap_err(),
        Error::InvalidParameter
    );
}

#[test]
fn test_ipc_event_releases_device_wait_in_other_context() {
    let driver = Driver::new(DriverConfig::default()).unwrap();
    let parent = Context::new(Arc::clone(&driver));
    let child = Context::new(Arc::clone(&driver));

    let pool = EventPool::create(
        &parent,
        EventPoolDesc::default().with_flags(EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC),
    )
    .unwrap();
    let origin = pool.create_event(EventDesc::default().with_index(0)).unwrap();
    let token = *pool.ipc_handle().unwrap().as_bytes();

    let imported = EventPool::open_ipc(&child, &IpcHandle::from_bytes(&token).unwrap()).unwrap();
    let alias = imported.create_event(EventDesc::default().with_index(0)).unwrap();
    let buf = child.alloc_host(4).unwrap();
    let queue = queue(&child);
    let list = list(&child);
    list.append(Command::memory_fill(buf, 0xC, 4).with_waits(&[alias.clone()]))
        .unwrap();
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None).unwrap();

    assert!(queue.synchronize(WaitTimeout::millis(5)).is_timeout());
    origin.signal();
    assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&child, buf, 4), vec![0xC; 4]);

    // Parent events cannot be recorded into the child's lists.
    assert_eq!(
        list.reset()
            .and_then(|()| list.append(Command::signal_event(&origin)))
            .unwrap_err(),
        Error::InvalidParameter
    );
}

#[test]
fn test_ipc_memory_is_copied_by_importer() {
    let driver = Driver::new(DriverConfig::default()).unwrap();
    let parent = Context::new(Arc::clone(&driver));
    let child = Context::new(Arc::clone(&driver));

    let device_buf = parent.alloc_device(DeviceId(0), 32).unwrap();
    let parent_queue = queue(&parent);
    let fill = list(&parent);
    fill.append(Command::memory_fill(device_buf, 0x5A, 32)).unwrap();
    fill.close().unwrap();
    parent_queue.execute_command_lists(&[&fill], None).unwrap();
    assert!(parent_queue.synchronize(WaitTimeout::Infinite).is_success());

    let handle = parent.ipc_memory_handle(device_buf).unwrap();
    let mapped = child.open_ipc_memory(&handle).unwrap();
    let out = child.alloc_host(32).unwrap();
    let child_queue = queue(&child);
    let copy = list(&child);
    copy.append(Command::memory_copy(out, mapped, 32)).unwrap();
    copy.close().unwrap();
    child_queue.execute_command_lists(&[&copy], None).unwrap();
    assert!(child_queue.synchronize(WaitTimeout::Infinite).is_success());

    assert_eq!(bytes(&child, out, 32), vec![0x5A; 32]);
    child.close_ipc_memory(mapped).unwrap();
}

// =============================================================================
// COPY ENGINES, INDIRECT LAUNCHES, IMAGES
// =============================================================================

#[test]
fn test_copy_only_lists_need_copy_queues() {
    let ctx = context();
    let copy_desc = CommandListDesc::default().with_flags(CommandListFlags::COPY_ONLY);
    let list = CommandList::create(&ctx, DeviceId(0), copy_desc).unwrap();
    let a = ctx.alloc_host(8).unwrap();
    let b = ctx.alloc_host(8).unwrap();

    assert_eq!(
        list.append(Command::launch_kernel(
            store_one(),
            GroupCount::linear(1),
            KernelArgs::new().buffer(a),
        ))
        .unwrap_err(),
        Error::Unsupported
    );
    list.append(Command::memory_fill(a, 0x4, 8)).unwrap();
    list.append(Command::memory_copy(b, a, 8)).unwrap();
    list.close().unwrap();

    let compute = queue(&ctx);
    assert_eq!(
        compute.execute_command_lists(&[&list], None).unwrap_err(),
        Error::InvalidParameter
    );

    let copy_queue = CommandQueue::create(
        &ctx,
        DeviceId(0),
        CommandQueueDesc::default().with_flags(CommandQueueFlags::COPY_ONLY),
    )
    .unwrap();
    copy_queue.execute_command_lists(&[&list], None).unwrap();
    assert!(copy_queue.synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&ctx, b, 8), vec![0x4; 8]);
}

#[test]
fn test_concurrent_atomics_from_two_devices_add_up() {
    const GROUPS: u32 = 20_000;
    let ctx = Context::new(Driver::new(DriverConfig::multi_device(2)).unwrap());
    let counter = ctx.alloc_device(DeviceId(0), 4).unwrap();
    let out = ctx.alloc_host(4).unwrap();

    let queues: Vec<CommandQueue> = [DeviceId(0), DeviceId(1)]
        .into_iter()
        .map(|dev| CommandQueue::create(&ctx, dev, CommandQueueDesc::default()).unwrap())
        .collect();
    let lists: Vec<CommandList> = queues
        .iter()
        .map(|q| {
            let list = CommandList::create(&ctx, q.device(), CommandListDesc::default()).unwrap();
            list.append(Command::launch_kernel(
                atomic_increment(),
                GroupCount::linear(GROUPS),
                KernelArgs::new().buffer_with(counter, AccessTier::ConcurrentAtomic),
            ))
            .unwrap();
            list.close().unwrap();
            list
        })
        .collect();

    for (queue, list) in queues.iter().zip(&lists) {
        queue.execute_command_lists(&[list], None).unwrap();
    }
    for queue in &queues {
        assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
    }

    let readback = list(&ctx);
    readback.append(Command::memory_copy(out, counter, 4)).unwrap();
    readback.close().unwrap();
    queues[0].execute_command_lists(&[&readback], None).unwrap();
    assert!(queues[0].synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&ctx, out, 4), (2 * GROUPS).to_le_bytes().to_vec());
}

#[test]
fn test_lists_do_not_cross_drivers() {
    let a = context();
    let b = context();
    assert_ne!(a.id(), b.id());

    let buf_a = a.alloc_host(16).unwrap();
    let buf_b = b.alloc_host(16).unwrap();
    let foreign_queue = queue(&b);
    let fill = list(&a);
    fill.append(Command::memory_fill(buf_a, 0x5, 16)).unwrap();
    fill.close().unwrap();

    assert_eq!(
        foreign_queue.execute_command_lists(&[&fill], None).unwrap_err(),
        Error::InvalidParameter
    );
    assert_eq!(fill.in_flight(), 0);

    // A fence only binds to the queue it was created on.
    let own_queue = queue(&a);
    let foreign_fence = Fence::create(&foreign_queue);
    assert_eq!(
        own_queue.execute_command_lists(&[&fill], Some(&foreign_fence)).unwrap_err(),
        Error::InvalidParameter
    );

    assert!(foreign_queue.synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&b, buf_b, 16), vec![0; 16]);
    assert_eq!(bytes(&a, buf_a, 16), vec![0; 16]);
}

#[test]
fn test_multiple_indirect_launch_honors_count() {
    let ctx = context();
    let queue = queue(&ctx);
    let counters = ctx.alloc_host(12).unwrap();
    let count = ctx.alloc_host(4).unwrap();
    let groups = ctx.alloc_host(3 * GROUP_COUNT_SIZE).unwrap();

    let launches: Vec<IndirectLaunch> = (0..3)
        .map(|i| IndirectLaunch {
            kernel: increment(),
            args: KernelArgs::new().buffer(counters.offset(i * 4)),
        })
        .collect();
    let list = list(&ctx);
    list.append(Command::launch_multiple_kernels_indirect(launches, count, groups))
        .unwrap();
    list.close().unwrap();

    // Counts are read when the command runs, not when it is recorded.
    ctx.write(count, &2u32.to_le_bytes()).unwrap();
    let mut layout = Vec::new();
    layout.extend_from_slice(&GroupCount::linear(2).to_le_bytes());
    layout.extend_from_slice(&GroupCount::new(2, 2, 1).to_le_bytes());
    layout.extend_from_slice(&GroupCount::linear(9).to_le_bytes());
    ctx.write(groups, &layout).unwrap();

    queue.execute_command_lists(&[&list], None).unwrap();
    assert!(queue.synchronize(WaitTimeout::Infinite).is_success());

    let out = bytes(&ctx, counters, 12);
    assert_eq!(&out[0..4], &2u32.to_le_bytes());
    assert_eq!(&out[4..8], &4u32.to_le_bytes());
    assert_eq!(&out[8..12], &0u32.to_le_bytes());
}

#[test]
fn test_image_region_copy_through_queue() {
    let ctx = context();
    let queue = queue(&ctx);
    let src = Image::create(&ctx, DeviceId(0), ImageDesc::new_2d(4, 4, 1)).unwrap();
    let dst = Image::create(&ctx, DeviceId(0), ImageDesc::new_2d(4, 4, 1)).unwrap();
    let staging = ctx.alloc_host(16).unwrap();
    let out = ctx.alloc_host(4).unwrap();
    ctx.write(staging, &(0..16).collect::<Vec<u8>>()).unwrap();

    let full = ImageRegion::new(0, 0, 0, 4, 4, 1);
    let corner = ImageRegion::new(0, 0, 0, 2, 2, 1);
    let list = list(&ctx);
    list.append(Command::image_copy(ImageCopy::FromMemory {
        dst: src.clone(),
        region: full,
        src: staging,
    }))
    .unwrap();
    list.append(Command::image_copy(ImageCopy::Region {
        dst: dst.clone(),
        dst_region: corner,
        src,
        src_region: ImageRegion::new(2, 2, 0, 2, 2, 1),
    }))
    .unwrap();
    list.append(Command::image_copy(ImageCopy::ToMemory {
        dst: out,
        src: dst,
        region: corner,
    }))
    .unwrap();
    list.close().unwrap();

    queue.execute_command_lists(&[&list], None).unwrap();
    assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
    assert_eq!(bytes(&ctx, out, 4), vec![10, 11, 14, 15]);
}

#[test]
fn test_prefetch_and_advice_reach_the_allocation() {
    let ctx = context();
    let queue = queue(&ctx);
    let shared = ctx.alloc_shared(DeviceId(0), 4096).unwrap();
    let list = list(&ctx);
    list.append(Command::memory_prefetch(shared, 4096)).unwrap();
    list.append(Command::mem_advise(
        shared,
        4096,
        ember_core::MemAdvice::SetReadMostly,
    ))
    .unwrap();
    list.append(Command::memory_ranges_barrier(&[(shared, 4096)]))
        .unwrap();
    list.close().unwrap();

    queue.execute_command_lists(&[&list], None).unwrap();
    assert!(queue.synchronize(WaitTimeout::Infinite).is_success());
    let info = ctx.allocation(shared).unwrap();
    assert_eq!(info.prefetch_count, 1);
    assert!(info.read_mostly);
}
