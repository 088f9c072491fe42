use lupine_gpu::{
    vk, AttachmentDesc, CommandPool, DeviceContext, FrameConfig, FrameOrchestrator, FrameStatus,
    GpuError, Pipeline, PipelineCacheRegistry, PipelineConfig, PushConstants, Recorder,
    SlotState,
};
use lupine_gpu::vk::Handle;
use lupine_gpu::PresentationTarget;
use lupine_test::{
    init_test_logging, stub_shaders, Call, Event, FailPoint, FakeDevice, FakeTarget, HandleKind,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct Fixture {
    fake: Arc<FakeDevice>,
    device: Arc<dyn DeviceContext>,
    target: FakeTarget,
    frames: FrameOrchestrator,
}

fn fixture(images: usize, frames_in_flight: usize) -> Fixture {
    init_test_logging();
    let fake = Arc::new(FakeDevice::new());
    let device = fake.as_context();
    let target = FakeTarget::new(&fake, 800, 600, images);
    let frames = FrameOrchestrator::new(
        &device,
        &target,
        &[AttachmentDesc::color()],
        FrameConfig::default().with_frames_in_flight(frames_in_flight),
    )
    .unwrap();

    Fixture {
        fake,
        device,
        target,
        frames,
    }
}

fn draw_triangle(recorder: &mut Recorder<'_>) -> lupine_gpu::Result<()> {
    recorder.begin_render_pass()?;
    recorder.draw(3, 1, 0, 0);
    recorder.end_render_pass()
}

fn render(f: &mut Fixture) -> lupine_gpu::Result<FrameStatus> {
    f.frames.render_frame(&mut f.target, draw_triangle, &[])
}

/// No command buffer is begun, reset or resubmitted while a submission that
/// uses it has not been observed retired through its fence or an idle wait.
fn assert_no_reuse_before_retire(events: &[Event]) {
    let mut pending: HashMap<vk::CommandBuffer, vk::Fence> = HashMap::new();

    for event in events {
        match &event.call {
            Call::QueueSubmit {
                command_buffers,
                fence,
                ..
            } => {
                for cmd in command_buffers {
                    assert!(
                        !pending.contains_key(cmd),
                        "t={}: {cmd:?} resubmitted before its fence signaled",
                        event.time
                    );
                    pending.insert(*cmd, *fence);
                }
            }
            Call::BeginCommandBuffer(cmd) | Call::ResetCommandBuffer(cmd) => {
                assert!(
                    !pending.contains_key(cmd),
                    "t={}: {cmd:?} re-recorded before its fence signaled",
                    event.time
                );
            }
            Call::FenceSignaled(fence) => pending.retain(|_, guard| guard != fence),
            Call::QueueWaitIdle | Call::DeviceWaitIdle => pending.clear(),
            _ => {}
        }
    }
}

fn count(fake: &FakeDevice, predicate: impl Fn(&Call) -> bool) -> usize {
    fake.calls().iter().filter(|call| predicate(call)).count()
}

fn submissions(fake: &FakeDevice) -> Vec<Call> {
    fake.calls()
        .into_iter()
        .filter(|call| matches!(call, Call::QueueSubmit { .. }))
        .collect()
}

#[test]
fn fences_guard_command_buffer_reuse() {
    let mut f = fixture(3, 2);

    for frame in 0..12u64 {
        let status = render(&mut f).unwrap();
        let report = status.report().unwrap();
        assert!(!status.needs_resize());
        assert_eq!(report.frame_number, frame);
        assert_eq!(report.image_index, (frame % 3) as u32);
    }

    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
    assert_eq!(f.target.presented().len(), 12);
}

#[test]
fn out_of_order_images_wait_for_their_own_fence() {
    let mut f = fixture(3, 2);
    f.target.script_acquire_order(&[0, 1, 1, 0, 2, 2, 1, 0]);

    for _ in 0..8 {
        render(&mut f).unwrap();
    }

    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
    assert_eq!(f.target.presented(), &[0, 1, 1, 0, 2, 2, 1, 0]);
}

#[test]
fn single_frame_in_flight_is_fully_serialized() {
    let mut f = fixture(2, 1);
    assert_eq!(f.frames.frames_in_flight(), 1);

    for _ in 0..5 {
        render(&mut f).unwrap();
    }

    let events = f.fake.events();
    let mut last_submit = None;
    for event in &events {
        match event.call {
            Call::QueueSubmit { fence, .. } => {
                assert!(last_submit.is_none(), "t={}: two frames in flight", event.time);
                last_submit = Some(fence);
            }
            Call::FenceSignaled(fence) if last_submit == Some(fence) => last_submit = None,
            _ => {}
        }
    }
    f.fake.check().unwrap();
}

#[test]
fn frames_in_flight_are_clamped() {
    init_test_logging();
    let fake = Arc::new(FakeDevice::new());
    let device = fake.as_context();
    let target = FakeTarget::new(&fake, 64, 64, 3);

    for (requested, effective) in [(0, 1), (2, 2), (5, 3)] {
        let frames = FrameOrchestrator::new(
            &device,
            &target,
            &[AttachmentDesc::color()],
            FrameConfig::default().with_frames_in_flight(requested),
        )
        .unwrap();
        assert_eq!(frames.frames_in_flight(), effective);
        assert_eq!(frames.image_count(), 3);
    }

    let empty = FakeTarget::new(&fake, 64, 64, 0);
    assert!(matches!(
        FrameOrchestrator::new(&device, &empty, &[AttachmentDesc::color()], FrameConfig::default()),
        Err(GpuError::InvalidArgument(_))
    ));
    fake.check().unwrap();
}

#[test]
fn passes_take_a_single_color_attachment() {
    init_test_logging();
    let fake = Arc::new(FakeDevice::new());
    let device = fake.as_context();
    let target = FakeTarget::new(&fake, 64, 64, 2).with_multisample();
    let multisampled = AttachmentDesc::color().with_samples(vk::SampleCountFlags::TYPE_4);

    for attachments in [
        vec![AttachmentDesc::color(), AttachmentDesc::color()],
        vec![
            multisampled,
            multisampled,
            AttachmentDesc::resolve(),
            AttachmentDesc::resolve(),
        ],
    ] {
        assert!(matches!(
            FrameOrchestrator::new(&device, &target, &attachments, FrameConfig::default()),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    assert_eq!(fake.live_handles(), 0);
    fake.check().unwrap();
}

#[test]
fn records_only_when_dirty() {
    let mut f = fixture(3, 2);
    let mut recorded = 0;
    let frame = |f: &mut Fixture, recorded: &mut usize| {
        f.frames
            .render_frame(
                &mut f.target,
                |recorder| {
                    *recorded += 1;
                    draw_triangle(recorder)
                },
                &[],
            )
            .unwrap()
            .report()
            .unwrap()
    };

    assert!(f.frames.is_dirty());
    assert!(frame(&mut f, &mut recorded).rerecorded);
    assert_eq!(recorded, 3);
    assert!(!f.frames.is_dirty());

    for _ in 0..4 {
        assert!(!frame(&mut f, &mut recorded).rerecorded);
    }
    assert_eq!(recorded, 3);

    f.frames.mark_dirty();
    assert!(frame(&mut f, &mut recorded).rerecorded);
    assert_eq!(recorded, 6);

    let clear = f.frames.config().clear_color;
    f.frames.set_clear_color(clear);
    assert!(!f.frames.is_dirty());
    f.frames.set_clear_color([0.0, 0.0, 0.0, 1.0]);
    assert!(f.frames.is_dirty());
    assert!(frame(&mut f, &mut recorded).rerecorded);
    assert_eq!(recorded, 9);

    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
}

#[test]
fn rerecording_waits_for_every_pending_frame() {
    let mut f = fixture(3, 2);
    render(&mut f).unwrap();
    render(&mut f).unwrap();

    f.fake.clear_events();
    f.frames.mark_dirty();
    render(&mut f).unwrap();

    let calls = f.fake.calls();
    let first_begin = calls
        .iter()
        .position(|call| matches!(call, Call::BeginCommandBuffer(_)))
        .unwrap();
    let signaled_before = calls[..first_begin]
        .iter()
        .filter(|call| matches!(call, Call::FenceSignaled(_)))
        .count();
    assert_eq!(signaled_before, 2);
    f.fake.check().unwrap();
}

#[test]
fn slot_states_track_submission() {
    let mut f = fixture(3, 2);
    assert_eq!(f.frames.slot_state(0), Some(SlotState::Idle));
    assert_eq!(f.frames.slot_state(3), None);

    render(&mut f).unwrap();
    assert_eq!(f.frames.slot_state(0), Some(SlotState::Submitted));
    assert_eq!(f.frames.slot_state(1), Some(SlotState::Idle));

    render(&mut f).unwrap();
    render(&mut f).unwrap();
    // Frame 2 reused slot 0 and retired image 0 on the way.
    assert_eq!(f.frames.slot_state(0), Some(SlotState::Retired));
    assert_eq!(f.frames.slot_state(2), Some(SlotState::Submitted));

    f.frames.wait_idle().unwrap();
    for image in 0..3 {
        assert_eq!(f.frames.slot_state(image), Some(SlotState::Retired));
    }
}

#[test]
fn submission_shape() {
    let mut f = fixture(3, 2);
    for _ in 0..3 {
        render(&mut f).unwrap();
    }

    let calls = f.fake.calls();
    let acquires: Vec<vk::Semaphore> = calls
        .iter()
        .filter_map(|call| match call {
            Call::AcquireImage { semaphore, .. } => Some(*semaphore),
            _ => None,
        })
        .collect();
    let presents: Vec<vk::Semaphore> = calls
        .iter()
        .filter_map(|call| match call {
            Call::Present { wait_semaphore, .. } => Some(*wait_semaphore),
            _ => None,
        })
        .collect();

    let submits = submissions(&f.fake);
    assert_eq!(submits.len(), 3);
    for (i, submit) in submits.iter().enumerate() {
        let Call::QueueSubmit {
            command_buffers,
            wait_semaphores,
            wait_stages,
            signal_semaphores,
            fence,
        } = submit
        else {
            unreachable!();
        };
        assert_eq!(command_buffers.len(), 1);
        assert_eq!(wait_semaphores, &vec![acquires[i]]);
        assert_eq!(
            wait_stages,
            &vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT]
        );
        assert_eq!(signal_semaphores, &vec![presents[i]]);
        assert_ne!(*fence, vk::Fence::null());
    }

    // Slots alternate, so frames 0 and 2 share semaphores and a fence.
    assert_eq!(acquires[0], acquires[2]);
    assert_ne!(acquires[0], acquires[1]);
}

#[test]
fn extra_command_buffers_ride_along() {
    let mut f = fixture(2, 1);
    let pool = CommandPool::new(&f.device, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .unwrap();
    let extra = pool.allocate_command_buffers(1).unwrap()[0];
    unsafe {
        f.device
            .begin_command_buffer(extra, &vk::CommandBufferBeginInfo::default())
            .unwrap();
        f.device.end_command_buffer(extra).unwrap();
    }

    f.frames
        .render_frame(&mut f.target, draw_triangle, &[extra])
        .unwrap();
    f.frames
        .render_frame(&mut f.target, draw_triangle, &[extra])
        .unwrap();

    let submits = submissions(&f.fake);
    for submit in &submits {
        let Call::QueueSubmit {
            command_buffers, ..
        } = submit
        else {
            unreachable!();
        };
        assert_eq!(command_buffers.len(), 2);
        assert_eq!(command_buffers[1], extra);
    }

    f.frames.wait_idle().unwrap();
    drop(pool);
    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
}

#[test]
fn draw_commands_reach_the_command_buffer() {
    let mut f = fixture(2, 2);
    render(&mut f).unwrap();

    let framebuffers: HashSet<vk::Framebuffer> =
        f.frames.framebuffers().handles().iter().copied().collect();
    let render_pass = f.frames.render_pass().handle();
    let calls = f.fake.calls();

    let begins: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            Call::BeginRenderPass {
                render_pass: pass,
                framebuffer,
                clear_values,
                ..
            } => Some((*pass, *framebuffer, *clear_values)),
            _ => None,
        })
        .collect();
    assert_eq!(begins.len(), 2);
    for (pass, framebuffer, clear_values) in begins {
        assert_eq!(pass, render_pass);
        assert!(framebuffers.contains(&framebuffer));
        assert_eq!(clear_values, 1);
    }

    assert_eq!(count(&f.fake, |call| matches!(call, Call::Draw { vertex_count: 3, .. })), 2);
    assert!(calls.iter().any(|call| matches!(
        call,
        Call::SetViewport { viewport, .. } if viewport.width == 800.0 && viewport.height == 600.0
    )));
}

#[test]
fn depth_targets_get_a_depth_attachment() {
    init_test_logging();
    let fake = Arc::new(FakeDevice::new());
    let device = fake.as_context();
    let mut target = FakeTarget::new(&fake, 320, 240, 2).with_depth(vk::Format::D32_SFLOAT);
    let mut frames = FrameOrchestrator::new(
        &device,
        &target,
        &[AttachmentDesc::color(), AttachmentDesc::depth()],
        FrameConfig::default(),
    )
    .unwrap();
    assert!(frames.render_pass().has_depth());

    frames
        .render_frame(&mut target, draw_triangle, &[])
        .unwrap();

    let calls = fake.calls();
    let depth_view = target.depth_view().unwrap();
    for call in &calls {
        if let Call::CreateFramebuffer { views, .. } = call {
            assert_eq!(views.len(), 2);
            assert_eq!(views[1], depth_view);
        }
    }
    assert!(calls
        .iter()
        .any(|call| matches!(call, Call::BeginRenderPass { clear_values: 2, .. })));

    // The shared depth image is written by consecutive frames; each pass
    // waits for the previous one's late depth tests.
    let dependencies = calls
        .iter()
        .find_map(|call| match call {
            Call::CreateRenderPass { dependencies, .. } => Some(dependencies.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(dependencies.len(), 1);
    let external = dependencies[0];
    assert_eq!(external.src_subpass, vk::SUBPASS_EXTERNAL);
    for stages in [external.src_stage_mask, external.dst_stage_mask] {
        assert!(stages.contains(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        ));
    }
    assert!(external
        .src_access_mask
        .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    assert!(external
        .dst_access_mask
        .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));

    let plain = FakeTarget::new(&fake, 320, 240, 2);
    assert!(matches!(
        FrameOrchestrator::new(
            &device,
            &plain,
            &[AttachmentDesc::color(), AttachmentDesc::depth()],
            FrameConfig::default()
        ),
        Err(GpuError::InvalidArgument(_))
    ));
}

#[test]
fn push_constants_are_recorded_and_tracked() {
    let mut f = fixture(2, 2);
    let registry = PipelineCacheRegistry::new();
    let pipeline = Pipeline::load(
        &f.device,
        &registry,
        "main",
        f.frames.render_pass(),
        &stub_shaders().with_push_constants(vk::ShaderStageFlags::VERTEX, 0, 16),
        &PipelineConfig::default(),
    )
    .unwrap();

    let mut tint = PushConstants::new([1.0f32, 0.0, 0.0, 1.0]);
    let draw_tinted = |f: &mut Fixture, value: [f32; 4]| {
        f.frames
            .render_frame(
                &mut f.target,
                |recorder| {
                    recorder.begin_render_pass()?;
                    recorder.bind_pipeline(&pipeline, &[]);
                    recorder.push_constants(&pipeline, &value)?;
                    recorder.draw(3, 1, 0, 0);
                    recorder.end_render_pass()
                },
                &[],
            )
            .unwrap()
            .report()
            .unwrap()
    };
    let pushed = |fake: &FakeDevice| -> Vec<(vk::ShaderStageFlags, u32, Vec<u8>)> {
        fake.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::PushConstants {
                    stages,
                    offset,
                    data,
                    ..
                } => Some((stages, offset, data)),
                _ => None,
            })
            .collect()
    };

    assert!(draw_tinted(&mut f, *tint.get()).rerecorded);
    let first = pushed(&f.fake);
    assert_eq!(first.len(), 2);
    for (stages, offset, data) in &first {
        assert_eq!(*stages, vk::ShaderStageFlags::VERTEX);
        assert_eq!(*offset, 0);
        assert_eq!(data.as_slice(), tint.as_bytes());
    }

    assert!(!tint.set([1.0, 0.0, 0.0, 1.0], &mut f.frames));
    assert!(!f.frames.is_dirty());
    assert!(!draw_tinted(&mut f, *tint.get()).rerecorded);
    assert_eq!(pushed(&f.fake).len(), 2);

    assert!(tint.set([0.0, 1.0, 0.0, 1.0], &mut f.frames));
    assert!(f.frames.is_dirty());
    assert!(draw_tinted(&mut f, *tint.get()).rerecorded);
    let all = pushed(&f.fake);
    assert_eq!(all.len(), 4);
    assert_eq!(all[3].2.as_slice(), bytemuck::bytes_of(&[0.0f32, 1.0, 0.0, 1.0]));

    f.frames.wait_idle().unwrap();
    f.fake.check().unwrap();
}

#[test]
fn push_constants_outside_the_layout_are_rejected() {
    let mut f = fixture(2, 2);
    let registry = PipelineCacheRegistry::new();
    let config = PipelineConfig::default();
    let plain = Pipeline::load(
        &f.device,
        &registry,
        "main",
        f.frames.render_pass(),
        &stub_shaders(),
        &config,
    )
    .unwrap();
    let ranged = Pipeline::load(
        &f.device,
        &registry,
        "main",
        f.frames.render_pass(),
        &stub_shaders().with_push_constants(vk::ShaderStageFlags::VERTEX, 0, 16),
        &config,
    )
    .unwrap();

    let result = f.frames.render_frame(
        &mut f.target,
        |recorder| {
            recorder.begin_render_pass()?;
            recorder.push_constants(&plain, &1.0f32)?;
            recorder.end_render_pass()
        },
        &[],
    );
    assert!(matches!(result, Err(GpuError::InvalidArgument(_))));

    let result = f.frames.render_frame(
        &mut f.target,
        |recorder| {
            recorder.begin_render_pass()?;
            recorder.push_constant_bytes(&ranged, vk::ShaderStageFlags::VERTEX, 12, &[0; 8])?;
            recorder.end_render_pass()
        },
        &[],
    );
    assert!(matches!(result, Err(GpuError::InvalidArgument(_))));

    let result = f.frames.render_frame(
        &mut f.target,
        |recorder| {
            recorder.begin_render_pass()?;
            recorder.push_constant_bytes(&ranged, vk::ShaderStageFlags::FRAGMENT, 0, &[0; 4])?;
            recorder.end_render_pass()
        },
        &[],
    );
    assert!(matches!(result, Err(GpuError::InvalidArgument(_))));

    assert_eq!(count(&f.fake, |call| matches!(call, Call::PushConstants { .. })), 0);
    assert!(f.frames.is_dirty());
    assert!(submissions(&f.fake).is_empty());
    f.fake.check().unwrap();
}

#[test]
fn submission_failures_are_not_retried() {
    let mut f = fixture(3, 2);
    f.fake
        .fail_next(FailPoint::QueueSubmit, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

    assert_eq!(
        render(&mut f).err(),
        Some(GpuError::Submission(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
    );
    assert_eq!(
        count(&f.fake, |call| matches!(
            call,
            Call::Failed {
                point: FailPoint::QueueSubmit,
                ..
            }
        )),
        1
    );
    assert!(submissions(&f.fake).is_empty());
    assert_eq!(f.frames.frame_number(), 0);
    assert!(f.frames.needs_rebuild());

    // The acquired image was never presented, so nothing more is acquired
    // until the target is rebuilt.
    for _ in 0..3 {
        assert_eq!(render(&mut f).unwrap(), FrameStatus::NeedsResize(None));
    }
    assert_eq!(count(&f.fake, |call| matches!(call, Call::AcquireImage { .. })), 1);
    assert_eq!(f.target.held_images(), 1);

    f.target.resize(800, 600, 3);
    f.frames.resize(&f.target).unwrap();
    assert!(!f.frames.needs_rebuild());

    let report = render(&mut f).unwrap().report().unwrap();
    assert_eq!(report.frame_number, 0);
    assert!(report.rerecorded);
    assert_eq!(submissions(&f.fake).len(), 1);

    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
}

#[test]
fn fence_wait_failures_are_not_retried() {
    let mut f = fixture(2, 1);
    render(&mut f).unwrap();

    f.fake.fail_next(FailPoint::WaitForFence, vk::Result::TIMEOUT);
    assert_eq!(
        render(&mut f).err(),
        Some(GpuError::Synchronization {
            operation: "fence wait",
            source: vk::Result::TIMEOUT,
        })
    );
    assert_eq!(
        count(&f.fake, |call| matches!(call, Call::WaitForFence { .. })),
        1
    );
    assert_eq!(
        count(&f.fake, |call| matches!(call, Call::AcquireImage { .. })),
        1
    );

    // The slot is still pending, so the next frame waits again and proceeds.
    render(&mut f).unwrap();
    assert_eq!(submissions(&f.fake).len(), 2);
    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
}

#[test]
fn device_loss_surfaces_as_device_lost() {
    let mut f = fixture(2, 2);
    f.fake.fail_next(FailPoint::QueueSubmit, vk::Result::ERROR_DEVICE_LOST);
    assert!(render(&mut f).unwrap_err().is_device_lost());
    assert_eq!(render(&mut f).unwrap(), FrameStatus::NeedsResize(None));

    f.target.resize(800, 600, 2);
    f.frames.resize(&f.target).unwrap();

    f.target.fail_next_acquire(GpuError::DeviceLost);
    assert_eq!(render(&mut f).err(), Some(GpuError::DeviceLost));

    render(&mut f).unwrap();
    f.fake.fail_next(FailPoint::WaitForFence, vk::Result::ERROR_DEVICE_LOST);
    render(&mut f).unwrap();
    assert!(render(&mut f).unwrap_err().is_device_lost());
    f.fake.check().unwrap();
}

#[test]
fn out_of_date_acquire_skips_the_frame() {
    let mut f = fixture(3, 2);
    render(&mut f).unwrap();

    f.target.fail_next_acquire(GpuError::SwapchainOutOfDate);
    assert_eq!(render(&mut f).unwrap(), FrameStatus::NeedsResize(None));
    assert_eq!(submissions(&f.fake).len(), 1);
    assert_eq!(f.frames.frame_number(), 1);

    f.target.resize(800, 600, 3);
    f.frames.resize(&f.target).unwrap();
    let status = render(&mut f).unwrap();
    assert!(!status.needs_resize());
    assert!(status.report().unwrap().rerecorded);
    f.fake.check().unwrap();
}

#[test]
fn stale_presentation_requests_a_resize() {
    let mut f = fixture(3, 2);

    f.target.fail_next_present(GpuError::SwapchainOutOfDate);
    let status = render(&mut f).unwrap();
    assert!(status.needs_resize());
    assert_eq!(status.report().unwrap().frame_number, 0);
    assert_eq!(submissions(&f.fake).len(), 1);

    // A failed present keeps its image; no further frame runs until a rebuild.
    assert!(f.frames.needs_rebuild());
    assert_eq!(render(&mut f).unwrap(), FrameStatus::NeedsResize(None));
    assert_eq!(submissions(&f.fake).len(), 1);
    f.target.resize(800, 600, 3);
    f.frames.resize(&f.target).unwrap();

    f.target.present_suboptimal_next();
    let status = render(&mut f).unwrap();
    assert!(matches!(status, FrameStatus::NeedsResize(Some(_))));
    assert!(!f.frames.needs_rebuild());

    f.target.next_acquire_suboptimal();
    let status = render(&mut f).unwrap();
    assert!(matches!(status, FrameStatus::NeedsResize(Some(_))));

    let status = render(&mut f).unwrap();
    assert!(matches!(status, FrameStatus::Presented(_)));

    f.target.fail_next_present(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR));
    assert_eq!(
        render(&mut f).err(),
        Some(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
    );
    assert_eq!(render(&mut f).unwrap(), FrameStatus::NeedsResize(None));
    f.fake.check().unwrap();
}

#[test]
fn resize_rebuilds_framebuffers() {
    let mut f = fixture(3, 2);
    for _ in 0..4 {
        render(&mut f).unwrap();
    }

    let old_framebuffers = f.frames.framebuffers().handles().to_vec();
    let old_pass = f.frames.render_pass().handle();

    f.target.resize(1024, 768, 3);
    f.frames.resize(&f.target).unwrap();

    assert_eq!(
        f.frames.framebuffers().extent(),
        vk::Extent2D {
            width: 1024,
            height: 768
        }
    );
    assert!(f.frames.is_dirty());
    for framebuffer in &old_framebuffers {
        assert!(!f.fake.is_live(framebuffer.as_raw()));
    }
    assert!(!f.fake.is_live(old_pass.as_raw()));

    let fresh: HashSet<vk::Framebuffer> =
        f.frames.framebuffers().handles().iter().copied().collect();
    let pass = f.frames.render_pass().handle();
    let widths: Vec<u32> = f
        .fake
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::CreateFramebuffer {
                framebuffer, width, ..
            } if fresh.contains(&framebuffer) => Some(width),
            _ => None,
        })
        .collect();
    assert_eq!(widths, vec![1024; 3]);

    f.fake.clear_events();
    for _ in 0..4 {
        render(&mut f).unwrap();
    }

    for call in f.fake.calls() {
        match call {
            Call::BeginRenderPass {
                render_pass,
                framebuffer,
                ..
            } => {
                assert_eq!(render_pass, pass);
                assert!(fresh.contains(&framebuffer));
            }
            Call::SetViewport { viewport, .. } => {
                assert_eq!((viewport.width, viewport.height), (1024.0, 768.0));
            }
            _ => {}
        }
    }

    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
}

#[test]
fn resize_follows_a_new_image_count() {
    let mut f = fixture(3, 3);
    for _ in 0..3 {
        render(&mut f).unwrap();
    }

    f.target.resize(640, 480, 2);
    f.frames.resize(&f.target).unwrap();
    assert_eq!(f.frames.image_count(), 2);
    assert_eq!(f.frames.frames_in_flight(), 2);
    assert_eq!(f.fake.live_count(HandleKind::CommandBuffer), 2);
    assert_eq!(f.fake.live_count(HandleKind::Framebuffer), 2);
    assert_eq!(f.fake.live_count(HandleKind::Fence), 2);

    for frame in 0..4u32 {
        let report = render(&mut f).unwrap().report().unwrap();
        assert_eq!(report.image_index, frame % 2);
    }

    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
}

#[test]
fn render_pass_misuse_fails_the_recording() {
    let mut f = fixture(2, 2);

    let twice = f.frames.render_frame(
        &mut f.target,
        |recorder| {
            recorder.begin_render_pass()?;
            recorder.begin_render_pass()?;
            recorder.end_render_pass()
        },
        &[],
    );
    assert!(matches!(twice, Err(GpuError::InvalidState(_))));
    assert!(f.frames.is_dirty());
    assert_eq!(f.frames.slot_state(0), Some(SlotState::Idle));

    let left_open = f
        .frames
        .render_frame(&mut f.target, |recorder| recorder.begin_render_pass(), &[]);
    assert!(matches!(left_open, Err(GpuError::InvalidState(_))));

    let never_begun = f
        .frames
        .render_frame(&mut f.target, |recorder| recorder.end_render_pass(), &[]);
    assert!(matches!(never_begun, Err(GpuError::InvalidState(_))));

    assert!(submissions(&f.fake).is_empty());
    assert_eq!(count(&f.fake, |call| matches!(call, Call::AcquireImage { .. })), 0);
    assert!(!f.frames.needs_rebuild());

    let report = render(&mut f).unwrap().report().unwrap();
    assert!(report.rerecorded);
    assert!(!f.frames.is_dirty());
    f.fake.check().unwrap();
}

#[test]
fn callback_errors_propagate_and_keep_the_frame_dirty() {
    let mut f = fixture(3, 2);
    let mut calls = 0;

    let result = f.frames.render_frame(
        &mut f.target,
        |recorder| {
            calls += 1;
            if recorder.image_index() == 1 {
                return Err(GpuError::InvalidArgument("no mesh".to_string()));
            }
            draw_triangle(recorder)
        },
        &[],
    );

    assert_eq!(
        result.err(),
        Some(GpuError::InvalidArgument("no mesh".to_string()))
    );
    assert_eq!(calls, 2);
    assert!(f.frames.is_dirty());
    assert!(f
        .fake
        .calls()
        .iter()
        .any(|call| matches!(call, Call::ResetCommandBuffer(_))));
    assert_eq!(count(&f.fake, |call| matches!(call, Call::AcquireImage { .. })), 0);
    assert_eq!(f.target.held_images(), 0);

    // Both frames use slot 0's acquire semaphore, which must not carry a
    // leftover signal from the failed one.
    for _ in 0..4 {
        render(&mut f).unwrap();
    }
    assert_eq!(f.target.held_images(), 0);
    f.fake.check().unwrap();
}

#[test]
fn failures_after_acquire_wait_for_a_rebuild() {
    let mut f = fixture(3, 2);
    render(&mut f).unwrap();

    f.fake
        .fail_next(FailPoint::ResetFence, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    assert!(render(&mut f).is_err());
    assert!(f.frames.needs_rebuild());
    assert_eq!(f.target.held_images(), 1);

    let acquires = count(&f.fake, |call| matches!(call, Call::AcquireImage { .. }));
    assert_eq!(acquires, 2);
    for _ in 0..5 {
        assert_eq!(render(&mut f).unwrap(), FrameStatus::NeedsResize(None));
    }
    assert_eq!(
        count(&f.fake, |call| matches!(call, Call::AcquireImage { .. })),
        acquires
    );
    assert_eq!(submissions(&f.fake).len(), 1);

    f.target.resize(800, 600, 3);
    f.frames.resize(&f.target).unwrap();
    for _ in 0..6 {
        assert!(matches!(render(&mut f).unwrap(), FrameStatus::Presented(_)));
    }

    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
}

#[test]
fn stranded_semaphore_signals_are_caught() {
    init_test_logging();
    let fake = Arc::new(FakeDevice::new());
    let device = fake.as_context();
    let mut target = FakeTarget::new(&fake, 64, 64, 3);
    let semaphore = unsafe { device.create_semaphore() }.unwrap();

    let first = unsafe { target.acquire_next_image(semaphore, u64::MAX) }.unwrap();
    assert!(fake.semaphore_pending(semaphore));
    fake.check().unwrap();

    unsafe { target.acquire_next_image(semaphore, u64::MAX) }.unwrap();
    let violations = fake.violations();
    assert_eq!(violations.len(), 1);
    assert!(violations[0].contains("pending signal"));

    let queue = device.graphics_queue();
    unsafe { target.present(queue, first.index, semaphore) }.unwrap();
    assert!(!fake.semaphore_pending(semaphore));
    assert_eq!(fake.violations().len(), 1);

    // Image 1 is never presented; the round-robin comes back to it.
    for expected in [2, 0] {
        let image = unsafe { target.acquire_next_image(semaphore, u64::MAX) }.unwrap();
        assert_eq!(image.index, expected);
        unsafe { target.present(queue, image.index, semaphore) }.unwrap();
    }
    unsafe { target.acquire_next_image(semaphore, u64::MAX) }.unwrap();
    let violations = fake.violations();
    assert_eq!(violations.len(), 2);
    assert!(violations[1].contains("acquired again"));
}

#[test]
fn release_destroys_everything_once() {
    let mut f = fixture(3, 2);
    render(&mut f).unwrap();
    render(&mut f).unwrap();

    f.frames.release();
    f.frames.release();
    assert_eq!(f.fake.live_handles(), 0);
    assert!(matches!(render(&mut f), Err(GpuError::InvalidState(_))));

    assert_no_reuse_before_retire(&f.fake.events());
    f.fake.check().unwrap();
}
