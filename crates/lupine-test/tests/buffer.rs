use lupine_gpu::{vk, Buffer, CommandPool, DeviceContext, GpuError};
use lupine_test::{init_test_logging, Call, FailPoint, FakeDevice, HandleKind};
use std::sync::Arc;

fn fake() -> (Arc<FakeDevice>, Arc<dyn DeviceContext>) {
    init_test_logging();
    let fake = Arc::new(FakeDevice::new());
    let device = fake.as_context();
    (fake, device)
}

fn host_coherent() -> vk::MemoryPropertyFlags {
    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
}

#[test]
fn pattern_round_trip() {
    let (fake, device) = fake();
    let pattern: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();

    let mut buffer = Buffer::load(
        &device,
        1024,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        host_coherent(),
    )
    .unwrap();
    buffer.bind().unwrap();
    buffer.set_data(&pattern).unwrap();

    let mut read_back = vec![0u8; 1024];
    buffer.read_data(&mut read_back).unwrap();
    assert_eq!(read_back, pattern);

    let contents = fake.memory_contents(buffer.memory()).unwrap();
    assert_eq!(&contents[..1024], pattern.as_slice());

    assert!(fake.calls().iter().any(|call| matches!(
        call,
        Call::FlushMappedMemory { size, .. } if *size == vk::WHOLE_SIZE
    )));

    buffer.release();
    fake.check().unwrap();
    assert_eq!(fake.live_handles(), 0);
}

#[test]
fn non_coherent_memory_is_mapped_whole_and_invalidated() {
    init_test_logging();
    let fake = Arc::new(FakeDevice::with_memory_types(&[
        vk::MemoryPropertyFlags::HOST_VISIBLE,
    ]));
    let device = fake.as_context();
    let pattern: Vec<u8> = (0..100u8).rev().collect();

    let mut buffer = Buffer::load(
        &device,
        100,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
    )
    .unwrap();
    buffer.bind().unwrap();
    buffer.set_data(&pattern).unwrap();

    let mut read_back = vec![0u8; 100];
    buffer.read_data(&mut read_back).unwrap();
    assert_eq!(read_back, pattern);

    let calls = fake.calls();
    let maps: Vec<u64> = calls
        .iter()
        .filter_map(|call| match call {
            Call::MapMemory { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(maps, vec![vk::WHOLE_SIZE; 2]);
    assert!(calls.iter().any(|call| matches!(
        call,
        Call::InvalidateMappedMemory { offset: 0, size, .. } if *size == vk::WHOLE_SIZE
    )));

    fake.check().unwrap();
}

#[test]
fn first_superset_memory_type_is_chosen() {
    let (fake, device) = fake();
    let usage = vk::BufferUsageFlags::UNIFORM_BUFFER;

    let cases = [
        (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
        (host_coherent(), 1),
        (
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
            2,
        ),
        (vk::MemoryPropertyFlags::HOST_CACHED, 3),
        (vk::MemoryPropertyFlags::empty(), 0),
    ];

    for (requested, expected) in cases {
        let buffer = Buffer::load(&device, 64, usage, requested).unwrap();
        assert_eq!(buffer.memory_type_index(), expected, "{requested:?}");
        assert!(buffer.memory_type_flags().contains(requested));
        assert_eq!(buffer.memory_flags(), requested);
        assert_eq!(fake.memory_type_of(buffer.memory()), Some(expected));
    }

    fake.check().unwrap();
}

#[test]
fn requirement_mask_restricts_selection() {
    init_test_logging();
    let fake = Arc::new(FakeDevice::new().with_buffer_type_bits(0b0100));
    let device = fake.as_context();

    let buffer = Buffer::load(
        &device,
        16,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
    )
    .unwrap();

    assert_eq!(buffer.memory_type_index(), 2);
    assert!(buffer
        .memory_type_flags()
        .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
}

#[test]
fn unsatisfiable_request_leaves_nothing_behind() {
    init_test_logging();
    let fake = Arc::new(FakeDevice::new().with_buffer_type_bits(0b0001));
    let device = fake.as_context();

    let result = Buffer::load(
        &device,
        256,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
    );

    assert!(matches!(
        result,
        Err(GpuError::MemoryTypeUnavailable {
            type_bits: 0b0001,
            ..
        })
    ));
    assert_eq!(fake.live_handles(), 0);
    fake.check().unwrap();
}

#[test]
fn allocation_failure_destroys_the_buffer() {
    let (fake, device) = fake();
    fake.fail_next(FailPoint::AllocateMemory, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

    let result = Buffer::load(
        &device,
        256,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        host_coherent(),
    );

    assert_eq!(
        result.err(),
        Some(GpuError::ResourceCreation {
            resource: "buffer memory",
            source: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        })
    );
    assert_eq!(fake.live_handles(), 0);
    fake.check().unwrap();
}

#[test]
fn device_loss_is_reported_as_such() {
    let (fake, device) = fake();
    fake.fail_next(FailPoint::CreateBuffer, vk::Result::ERROR_DEVICE_LOST);

    let result = Buffer::load(&device, 8, vk::BufferUsageFlags::VERTEX_BUFFER, host_coherent());
    assert_eq!(result.err(), Some(GpuError::DeviceLost));
}

#[test]
fn zero_sized_buffers_are_rejected() {
    let (fake, device) = fake();
    let result = Buffer::load(&device, 0, vk::BufferUsageFlags::VERTEX_BUFFER, host_coherent());
    assert!(matches!(result, Err(GpuError::InvalidArgument(_))));
    assert!(fake.calls().is_empty());
}

#[test]
fn device_local_memory_is_not_mapped() {
    let (fake, device) = fake();
    let mut buffer = Buffer::load(
        &device,
        128,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .unwrap();
    buffer.bind().unwrap();

    assert_eq!(buffer.set_data(&[7; 128]), Err(GpuError::HostAccessDenied));
    assert_eq!(buffer.read_data(&mut [0u8; 4]), Err(GpuError::HostAccessDenied));

    assert!(!fake
        .calls()
        .iter()
        .any(|call| matches!(call, Call::MapMemory { .. })));
    let contents = fake.memory_contents(buffer.memory()).unwrap();
    assert!(contents.iter().all(|&byte| byte == 0));
    fake.check().unwrap();
}

#[test]
fn payload_size_is_checked() {
    let (fake, device) = fake();
    let mut buffer = Buffer::load(
        &device,
        16,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        host_coherent(),
    )
    .unwrap();
    buffer.bind().unwrap();

    assert!(matches!(
        buffer.set_data(&[1; 17]),
        Err(GpuError::InvalidArgument(_))
    ));

    buffer.set_data(&[9; 4]).unwrap();
    let contents = fake.memory_contents(buffer.memory()).unwrap();
    assert_eq!(&contents[..4], &[9u8; 4]);
    assert_eq!(&contents[4..16], &[0u8; 12]);
}

#[test]
fn typed_writes() {
    let (fake, device) = fake();
    let mut buffer = Buffer::load(
        &device,
        16,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        host_coherent(),
    )
    .unwrap();
    buffer.bind().unwrap();

    buffer.write(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    let contents = fake.memory_contents(buffer.memory()).unwrap();
    let expected: &[u8] = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]);
    assert_eq!(&contents[..16], expected);
}

#[test]
fn binding_twice_is_an_error() {
    let (fake, device) = fake();
    let mut buffer = Buffer::load(
        &device,
        32,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        host_coherent(),
    )
    .unwrap();

    buffer.bind().unwrap();
    assert!(matches!(buffer.bind(), Err(GpuError::InvalidState(_))));
    assert!(buffer.is_bound());

    let binds = fake
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::BindBufferMemory { .. }))
        .count();
    assert_eq!(binds, 1);
    fake.check().unwrap();
}

#[test]
fn release_is_idempotent() {
    let (fake, device) = fake();
    let mut buffer = Buffer::load(
        &device,
        32,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        host_coherent(),
    )
    .unwrap();
    buffer.bind().unwrap();

    buffer.release();
    buffer.release();
    assert!(buffer.is_released());
    assert_eq!(buffer.size(), 0);
    assert!(matches!(buffer.set_data(&[1]), Err(GpuError::InvalidState(_))));
    drop(buffer);

    let calls = fake.calls();
    let destroy = calls
        .iter()
        .position(|call| matches!(call, Call::DestroyBuffer(_)))
        .unwrap();
    let free = calls
        .iter()
        .position(|call| matches!(call, Call::FreeMemory(_)))
        .unwrap();
    assert!(destroy < free);

    fake.check().unwrap();
    assert_eq!(fake.live_handles(), 0);
}

#[test]
fn staged_upload_reaches_device_local_memory() {
    let (fake, device) = fake();
    let data: Vec<u8> = (0..200u8).collect();

    let mut buffer = Buffer::load(
        &device,
        256,
        vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .unwrap();
    buffer.bind().unwrap();

    let pool = CommandPool::new(&device, vk::CommandPoolCreateFlags::TRANSIENT).unwrap();
    buffer.upload_via_staging(&pool, &data).unwrap();

    let contents = fake.memory_contents(buffer.memory()).unwrap();
    assert_eq!(&contents[..200], data.as_slice());

    let calls = fake.calls();
    assert!(calls.iter().any(|call| matches!(
        call,
        Call::CopyBuffer { dst, size: 200, .. } if *dst == buffer.handle()
    )));
    assert!(calls.iter().any(|call| matches!(call, Call::QueueWaitIdle)));

    // Only the destination survives; the staging buffer and the one-shot
    // command buffer are gone.
    assert_eq!(fake.live_count(HandleKind::Buffer), 1);
    assert_eq!(fake.live_count(HandleKind::CommandBuffer), 0);

    drop(pool);
    buffer.release();
    fake.check().unwrap();
    assert_eq!(fake.live_handles(), 0);
}

#[test]
fn staged_upload_requires_transfer_destination() {
    let (_fake, device) = fake();
    let mut buffer = Buffer::load(
        &device,
        64,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .unwrap();
    let pool = CommandPool::new(&device, vk::CommandPoolCreateFlags::TRANSIENT).unwrap();

    assert!(matches!(
        buffer.upload_via_staging(&pool, &[1; 8]),
        Err(GpuError::InvalidState(_))
    ));

    buffer.bind().unwrap();
    assert!(matches!(
        buffer.upload_via_staging(&pool, &[1; 8]),
        Err(GpuError::InvalidArgument(_))
    ));
}

#[test]
fn staging_buffers_are_host_coherent() {
    let (_fake, device) = fake();
    let staging = Buffer::load_as_staging(&device, 64).unwrap();
    assert!(staging.memory_type_flags().contains(host_coherent()));
    assert_eq!(staging.usage_flags(), vk::BufferUsageFlags::TRANSFER_SRC);
}
