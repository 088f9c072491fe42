//! Recording fake of the device context.
//!
//! Every call is appended to an event log with a monotonically increasing
//! timestamp. Misuse that a real driver would turn into undefined behavior
//! (double destroys, reusing a command buffer whose submission has not
//! retired, mapping device-local memory, ...) is recorded as a violation
//! instead.

use crate::HarnessError;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use lupine_gpu::{DeviceContext, DeviceId, QueueSubmit};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CStr;
use std::sync::Arc;

const ALIGNMENT: u64 = 256;
/// `nonCoherentAtomSize` assumed for non-coherent memory.
const NON_COHERENT_ATOM_SIZE: u64 = 64;

/// Kinds of handles the fake hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Buffer,
    Memory,
    PipelineCache,
    ShaderModule,
    PipelineLayout,
    Pipeline,
    RenderPass,
    Framebuffer,
    CommandPool,
    CommandBuffer,
    Semaphore,
    Fence,
}

/// Calls whose next invocation can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateBuffer,
    AllocateMemory,
    BindBufferMemory,
    MapMemory,
    CreatePipelineCache,
    CreateShaderModule,
    CreatePipelineLayout,
    CreateGraphicsPipeline,
    CreateRenderPass,
    CreateFramebuffer,
    CreateCommandPool,
    AllocateCommandBuffers,
    BeginCommandBuffer,
    CreateSemaphore,
    CreateFence,
    WaitForFence,
    ResetFence,
    QueueSubmit,
    QueueWaitIdle,
    DeviceWaitIdle,
}

/// One recorded device call.
#[derive(Debug, Clone)]
pub enum Call {
    CreateBuffer { buffer: vk::Buffer, size: u64 },
    DestroyBuffer(vk::Buffer),
    AllocateMemory { memory: vk::DeviceMemory, type_index: u32, size: u64 },
    FreeMemory(vk::DeviceMemory),
    BindBufferMemory { buffer: vk::Buffer, memory: vk::DeviceMemory, offset: u64 },
    MapMemory { memory: vk::DeviceMemory, offset: u64, size: u64 },
    FlushMappedMemory { memory: vk::DeviceMemory, offset: u64, size: u64 },
    InvalidateMappedMemory { memory: vk::DeviceMemory, offset: u64, size: u64 },
    UnmapMemory(vk::DeviceMemory),
    CreatePipelineCache { cache: vk::PipelineCache, seed_len: usize },
    DestroyPipelineCache(vk::PipelineCache),
    CreateShaderModule(vk::ShaderModule),
    DestroyShaderModule(vk::ShaderModule),
    CreatePipelineLayout { layout: vk::PipelineLayout, push_constant_ranges: usize },
    DestroyPipelineLayout(vk::PipelineLayout),
    CreateGraphicsPipeline { pipeline: vk::Pipeline, cache: vk::PipelineCache },
    DestroyPipeline(vk::Pipeline),
    CreateRenderPass {
        render_pass: vk::RenderPass,
        attachments: usize,
        dependencies: Vec<vk::SubpassDependency>,
    },
    DestroyRenderPass(vk::RenderPass),
    CreateFramebuffer {
        framebuffer: vk::Framebuffer,
        render_pass: vk::RenderPass,
        width: u32,
        height: u32,
        views: Vec<vk::ImageView>,
    },
    DestroyFramebuffer(vk::Framebuffer),
    CreateCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffers(Vec<vk::CommandBuffer>),
    FreeCommandBuffers(Vec<vk::CommandBuffer>),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    ResetCommandBuffer(vk::CommandBuffer),
    BeginRenderPass {
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        clear_values: usize,
    },
    EndRenderPass(vk::CommandBuffer),
    BindPipeline { cmd: vk::CommandBuffer, pipeline: vk::Pipeline },
    BindDescriptorSets { cmd: vk::CommandBuffer, sets: usize },
    SetViewport { cmd: vk::CommandBuffer, viewport: vk::Viewport },
    SetScissor { cmd: vk::CommandBuffer, scissor: vk::Rect2D },
    PushConstants {
        cmd: vk::CommandBuffer,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    BindVertexBuffers { cmd: vk::CommandBuffer, buffers: Vec<vk::Buffer> },
    BindIndexBuffer { cmd: vk::CommandBuffer, buffer: vk::Buffer },
    Draw { cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32 },
    DrawIndexed { cmd: vk::CommandBuffer, index_count: u32, instance_count: u32 },
    CopyBuffer { cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64 },
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateFence { fence: vk::Fence, signaled: bool },
    DestroyFence(vk::Fence),
    WaitForFence { fence: vk::Fence, timeout_ns: u64 },
    /// The fake signaled a fence: the submission it guards has retired.
    FenceSignaled(vk::Fence),
    ResetFence(vk::Fence),
    QueueSubmit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        wait_stages: Vec<vk::PipelineStageFlags>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    QueueWaitIdle,
    DeviceWaitIdle,
    AcquireImage { index: u32, semaphore: vk::Semaphore },
    Present { index: u32, wait_semaphore: vk::Semaphore },
    Failed { point: FailPoint, result: vk::Result },
}

/// A call with the fake clock value at which it happened.
#[derive(Debug, Clone)]
pub struct Event {
    pub time: u64,
    pub call: Call,
}

struct MemoryBlock {
    type_index: u32,
    bytes: Box<[u8]>,
    mapped: bool,
    /// End of the current mapping.
    mapped_end: u64,
}

#[derive(Default)]
struct FenceState {
    signaled: bool,
    pending: bool,
}

#[derive(Default)]
struct State {
    clock: u64,
    next_handle: u64,
    events: Vec<Event>,
    violations: Vec<String>,
    live: HashMap<u64, HandleKind>,
    memory: HashMap<u64, MemoryBlock>,
    buffer_sizes: HashMap<u64, u64>,
    buffer_bindings: HashMap<u64, u64>,
    shader_code: HashMap<u64, Vec<u32>>,
    layouts: HashSet<u64>,
    pipeline_signatures: HashMap<u64, String>,
    cache_blobs: HashMap<u64, Vec<u8>>,
    pool_buffers: HashMap<u64, Vec<u64>>,
    recording: HashSet<u64>,
    fences: HashMap<u64, FenceState>,
    /// Binary semaphores and whether a signal is pending on them.
    semaphores: HashMap<u64, bool>,
    /// Command buffers with a submission that has not retired, and the fence guarding it.
    in_flight: HashMap<u64, Option<u64>>,
    failures: HashMap<FailPoint, VecDeque<vk::Result>>,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn record(&mut self, call: Call) {
        let time = self.tick();
        self.events.push(Event { time, call });
    }

    fn violation(&mut self, message: String) {
        tracing::warn!("Device contract violation: {message}");
        self.violations.push(message);
    }

    fn new_handle(&mut self, kind: HandleKind) -> u64 {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.insert(raw, kind);
        raw
    }

    fn fail(&mut self, point: FailPoint) -> VkResult<()> {
        match self
            .failures
            .get_mut(&point)
            .and_then(VecDeque::pop_front)
        {
            Some(result) => {
                self.record(Call::Failed { point, result });
                Err(result)
            }
            None => Ok(()),
        }
    }

    /// Returns false (and records a violation) if `raw` is not a live `kind`.
    fn destroy(&mut self, raw: u64, kind: HandleKind) -> bool {
        if raw == 0 {
            return false;
        }
        if self.live.get(&raw) == Some(&kind) {
            self.live.remove(&raw);
            true
        } else {
            self.violation(format!("{kind:?} {raw:#x} destroyed twice or never created"));
            false
        }
    }

    fn check_live(&mut self, raw: u64, kind: HandleKind, what: &str) {
        if self.live.get(&raw) != Some(&kind) {
            self.violation(format!("{what} uses dead {kind:?} {raw:#x}"));
        }
    }

    fn check_retired(&mut self, cmd: u64, what: &str) {
        if self.in_flight.contains_key(&cmd) {
            self.violation(format!(
                "{what} command buffer {cmd:#x} before its submission retired"
            ));
        }
    }

    fn signal_fence(&mut self, fence: u64) {
        if let Some(state) = self.fences.get_mut(&fence) {
            state.signaled = true;
            state.pending = false;
        }
        self.in_flight.retain(|_, guard| *guard != Some(fence));
        self.record(Call::FenceSignaled(vk::Fence::from_raw(fence)));
    }

    fn signal_semaphore(&mut self, raw: u64, what: &str) {
        match self.semaphores.insert(raw, true) {
            Some(false) => {}
            Some(true) => self.violation(format!(
                "{what} on semaphore {raw:#x} with a pending signal"
            )),
            None => {
                self.semaphores.remove(&raw);
                self.violation(format!("{what} signals dead semaphore {raw:#x}"));
            }
        }
    }

    fn wait_semaphore(&mut self, raw: u64, what: &str) {
        match self.semaphores.get(&raw).copied() {
            Some(true) => {
                self.semaphores.insert(raw, false);
            }
            Some(false) => self.violation(format!(
                "{what} waits on semaphore {raw:#x} that nothing signals"
            )),
            None => self.violation(format!("{what} waits on dead semaphore {raw:#x}")),
        }
    }

    fn retire_everything(&mut self) {
        let pending: Vec<u64> = self
            .fences
            .iter()
            .filter(|(_, state)| state.pending)
            .map(|(&fence, _)| fence)
            .collect();
        for fence in pending {
            self.signal_fence(fence);
        }
        self.in_flight.clear();
    }
}

/// Fake [`DeviceContext`] backed by host memory.
pub struct FakeDevice {
    id: DeviceId,
    name: String,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    buffer_type_bits: u32,
    queue: vk::Queue,
    state: Mutex<State>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    /// Fake with four memory types:
    /// 0 `DEVICE_LOCAL`, 1 `HOST_VISIBLE | HOST_COHERENT`,
    /// 2 `DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT`,
    /// 3 `HOST_VISIBLE | HOST_COHERENT | HOST_CACHED`.
    pub fn new() -> Self {
        Self::with_memory_types(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ])
    }

    /// Fake with an explicit memory type table; every type is allowed for buffers.
    pub fn with_memory_types(types: &[vk::MemoryPropertyFlags]) -> Self {
        let id = DeviceId::next();
        Self {
            id,
            name: format!("fake device {}", id.raw()),
            memory_types: types.to_vec(),
            buffer_type_bits: (1u32 << types.len()) - 1,
            queue: vk::Queue::from_raw(0xC0DE),
            state: Mutex::new(State {
                next_handle: 0x1000,
                ..State::default()
            }),
        }
    }

    /// Restrict the memory types buffers report in their requirements.
    pub fn with_buffer_type_bits(mut self, bits: u32) -> Self {
        self.buffer_type_bits = bits;
        self
    }

    /// Share as a device context.
    pub fn as_context(self: &Arc<Self>) -> Arc<dyn DeviceContext> {
        Arc::clone(self) as Arc<dyn DeviceContext>
    }

    /// Make the next call at `point` fail with `result`. Failures queue up.
    pub fn fail_next(&self, point: FailPoint, result: vk::Result) {
        self.state
            .lock()
            .failures
            .entry(point)
            .or_default()
            .push_back(result);
    }

    /// Image acquisition by a presentation target: signals `semaphore`.
    pub fn acquire_image(&self, index: u32, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.signal_semaphore(semaphore.as_raw(), "acquire");
        state.record(Call::AcquireImage { index, semaphore });
    }

    /// Presentation by a presentation target: consumes `wait_semaphore`.
    pub fn present_image(&self, index: u32, wait_semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.wait_semaphore(wait_semaphore.as_raw(), "present");
        state.record(Call::Present {
            index,
            wait_semaphore,
        });
    }

    /// Report a misuse observed outside the device, e.g. by a fake target.
    pub fn report_violation(&self, message: String) {
        self.state.lock().violation(message);
    }

    /// Whether a signal is pending on `semaphore`.
    pub fn semaphore_pending(&self, semaphore: vk::Semaphore) -> bool {
        self.state
            .lock()
            .semaphores
            .get(&semaphore.as_raw())
            .copied()
            .unwrap_or(false)
    }

    /// Hand out an untracked handle value, e.g. for fake image views.
    pub fn fabricate_handle(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_handle += 1;
        state.next_handle
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Calls only, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().events.iter().map(|e| e.call.clone()).collect()
    }

    /// Forget recorded events; live-handle tracking is kept.
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Every contract violation observed so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// `Ok` when no contract violation was observed.
    pub fn check(&self) -> Result<(), HarnessError> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Violations(violations))
        }
    }

    /// Number of live handles of `kind`.
    pub fn live_count(&self, kind: HandleKind) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|live| **live == kind)
            .count()
    }

    /// Total number of live handles.
    pub fn live_handles(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Whether `raw` is a live handle.
    pub fn is_live(&self, raw: u64) -> bool {
        self.state.lock().live.contains_key(&raw)
    }

    /// Copy of a memory block's bytes.
    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Option<Vec<u8>> {
        self.state
            .lock()
            .memory
            .get(&memory.as_raw())
            .map(|block| block.bytes.to_vec())
    }

    /// Memory type a block was allocated from.
    pub fn memory_type_of(&self, memory: vk::DeviceMemory) -> Option<u32> {
        self.state
            .lock()
            .memory
            .get(&memory.as_raw())
            .map(|block| block.type_index)
    }

    /// Description of everything that determines a pipeline's output. The
    /// pipeline cache and layout handle are not part of it.
    pub fn pipeline_signature(&self, pipeline: vk::Pipeline) -> Option<String> {
        self.state
            .lock()
            .pipeline_signatures
            .get(&pipeline.as_raw())
            .cloned()
    }

    /// Whether `fence` is currently signaled.
    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .is_some_and(|state| state.signaled)
    }
}

impl FakeDevice {
    /// A flushed or invalidated range must lie in the mapping. On
    /// non-coherent memory its bounds must be atom-aligned or reach the end
    /// of the allocation.
    fn check_mapped_range(
        &self,
        state: &mut State,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
        what: &str,
    ) {
        let raw = memory.as_raw();
        let block = state
            .memory
            .get(&raw)
            .map(|block| {
                (
                    block.mapped,
                    block.mapped_end,
                    block.bytes.len() as u64,
                    block.type_index,
                )
            });
        let Some((mapped, mapped_end, len, type_index)) = block else {
            state.violation(format!("{what} dead memory {raw:#x}"));
            return;
        };
        if !mapped {
            state.violation(format!("{what} unmapped memory {raw:#x}"));
            return;
        }

        let coherent = self.memory_types[type_index as usize]
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        if coherent {
            return;
        }
        let end = if size == vk::WHOLE_SIZE {
            mapped_end
        } else {
            offset + size
        };
        let aligned = |at: u64| at % NON_COHERENT_ATOM_SIZE == 0 || at == len;
        if !aligned(offset) || !aligned(end) || end > mapped_end {
            state.violation(format!(
                "{what} range {offset}..{end} of non-coherent memory {raw:#x} is not atom-aligned"
            ));
        }
    }
}

impl DeviceContext for FakeDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: self.memory_types.len() as u32,
            memory_heap_count: 1,
            ..Default::default()
        };
        for (slot, flags) in properties.memory_types.iter_mut().zip(&self.memory_types) {
            *slot = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        properties.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        properties
    }

    fn graphics_queue(&self) -> vk::Queue {
        self.queue
    }

    fn graphics_queue_family(&self) -> u32 {
        0
    }

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreateBuffer)?;
        let raw = state.new_handle(HandleKind::Buffer);
        state.buffer_sizes.insert(raw, info.size);
        let buffer = vk::Buffer::from_raw(raw);
        state.record(Call::CreateBuffer {
            buffer,
            size: info.size,
        });
        Ok(buffer)
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state
            .buffer_sizes
            .get(&buffer.as_raw())
            .copied()
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: size.div_ceil(ALIGNMENT) * ALIGNMENT,
            alignment: ALIGNMENT,
            memory_type_bits: self.buffer_type_bits,
        }
    }

    unsafe fn allocate_memory(
        &self,
        info: &vk::MemoryAllocateInfo<'_>,
    ) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        state.fail(FailPoint::AllocateMemory)?;
        if info.memory_type_index as usize >= self.memory_types.len() {
            state.violation(format!(
                "Allocation from nonexistent memory type {}",
                info.memory_type_index
            ));
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let raw = state.new_handle(HandleKind::Memory);
        state.memory.insert(
            raw,
            MemoryBlock {
                type_index: info.memory_type_index,
                bytes: vec![0u8; info.allocation_size as usize].into_boxed_slice(),
                mapped: false,
                mapped_end: 0,
            },
        );
        let memory = vk::DeviceMemory::from_raw(raw);
        state.record(Call::AllocateMemory {
            memory,
            type_index: info.memory_type_index,
            size: info.allocation_size,
        });
        Ok(memory)
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.fail(FailPoint::BindBufferMemory)?;
        state.check_live(buffer.as_raw(), HandleKind::Buffer, "bind");
        state.check_live(memory.as_raw(), HandleKind::Memory, "bind");
        if state
            .buffer_bindings
            .insert(buffer.as_raw(), memory.as_raw())
            .is_some()
        {
            state.violation(format!("Buffer {:#x} bound twice", buffer.as_raw()));
        }
        state.record(Call::BindBufferMemory {
            buffer,
            memory,
            offset,
        });
        Ok(())
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8> {
        let mut state = self.state.lock();
        state.fail(FailPoint::MapMemory)?;
        state.record(Call::MapMemory {
            memory,
            offset,
            size,
        });

        let type_index = state
            .memory
            .get(&memory.as_raw())
            .map(|block| block.type_index);
        let Some(type_index) = type_index else {
            state.violation(format!("Mapping dead memory {:#x}", memory.as_raw()));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        };
        let host_visible = self.memory_types[type_index as usize]
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        if !host_visible {
            state.violation(format!(
                "Mapping memory {:#x} that is not host-visible",
                memory.as_raw()
            ));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        let mut already_mapped = false;
        let ptr = state.memory.get_mut(&memory.as_raw()).map(|block| {
            already_mapped = block.mapped;
            block.mapped = true;
            block.mapped_end = if size == vk::WHOLE_SIZE {
                block.bytes.len() as u64
            } else {
                offset + size
            };
            block.bytes[offset as usize..].as_mut_ptr()
        });
        if already_mapped {
            state.violation(format!("Memory {:#x} mapped twice", memory.as_raw()));
        }
        ptr.ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    unsafe fn flush_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        self.check_mapped_range(&mut state, memory, offset, size, "Flushing");
        state.record(Call::FlushMappedMemory {
            memory,
            offset,
            size,
        });
        Ok(())
    }

    unsafe fn invalidate_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        self.check_mapped_range(&mut state, memory, offset, size, "Invalidating");
        state.record(Call::InvalidateMappedMemory {
            memory,
            offset,
            size,
        });
        Ok(())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        let was_mapped = state
            .memory
            .get_mut(&memory.as_raw())
            .is_some_and(|block| std::mem::replace(&mut block.mapped, false));
        if !was_mapped {
            state.violation(format!("Unmapping unmapped memory {:#x}", memory.as_raw()));
        }
        state.record(Call::UnmapMemory(memory));
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.destroy(buffer.as_raw(), HandleKind::Buffer) {
            state.buffer_sizes.remove(&buffer.as_raw());
            state.buffer_bindings.remove(&buffer.as_raw());
            state.record(Call::DestroyBuffer(buffer));
        }
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        let raw = memory.as_raw();
        if state.buffer_bindings.values().any(|bound| *bound == raw) {
            state.violation(format!("Memory {raw:#x} freed while bound to a live buffer"));
        }
        if state.memory.get(&raw).is_some_and(|block| block.mapped) {
            state.violation(format!("Memory {raw:#x} freed while mapped"));
        }
        if state.destroy(raw, HandleKind::Memory) {
            state.memory.remove(&raw);
            state.record(Call::FreeMemory(memory));
        }
    }

    unsafe fn create_pipeline_cache(&self, initial_data: &[u8]) -> VkResult<vk::PipelineCache> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreatePipelineCache)?;
        let raw = state.new_handle(HandleKind::PipelineCache);
        let blob = if initial_data.is_empty() {
            b"fake-pipeline-cache".to_vec()
        } else {
            initial_data.to_vec()
        };
        state.cache_blobs.insert(raw, blob);
        let cache = vk::PipelineCache::from_raw(raw);
        state.record(Call::CreatePipelineCache {
            cache,
            seed_len: initial_data.len(),
        });
        Ok(cache)
    }

    unsafe fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> VkResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.check_live(cache.as_raw(), HandleKind::PipelineCache, "cache data");
        state
            .cache_blobs
            .get(&cache.as_raw())
            .cloned()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    unsafe fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        let mut state = self.state.lock();
        if state.destroy(cache.as_raw(), HandleKind::PipelineCache) {
            state.cache_blobs.remove(&cache.as_raw());
            state.record(Call::DestroyPipelineCache(cache));
        }
    }

    unsafe fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreateShaderModule)?;
        let raw = state.new_handle(HandleKind::ShaderModule);
        state.shader_code.insert(raw, code.to_vec());
        let module = vk::ShaderModule::from_raw(raw);
        state.record(Call::CreateShaderModule(module));
        Ok(module)
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        let mut state = self.state.lock();
        if state.destroy(module.as_raw(), HandleKind::ShaderModule) {
            state.shader_code.remove(&module.as_raw());
            state.record(Call::DestroyShaderModule(module));
        }
    }

    unsafe fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreatePipelineLayout)?;
        let raw = state.new_handle(HandleKind::PipelineLayout);
        state.layouts.insert(raw);
        let layout = vk::PipelineLayout::from_raw(raw);
        state.record(Call::CreatePipelineLayout {
            layout,
            push_constant_ranges: info.push_constant_range_count as usize,
        });
        Ok(layout)
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        let mut state = self.state.lock();
        if state.destroy(layout.as_raw(), HandleKind::PipelineLayout) {
            state.layouts.remove(&layout.as_raw());
            state.record(Call::DestroyPipelineLayout(layout));
        }
    }

    unsafe fn create_graphics_pipeline(
        &self,
        cache: vk::PipelineCache,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreateGraphicsPipeline)?;
        state.check_live(info.render_pass.as_raw(), HandleKind::RenderPass, "pipeline");
        state.check_live(info.layout.as_raw(), HandleKind::PipelineLayout, "pipeline");
        if cache != vk::PipelineCache::null() {
            state.check_live(cache.as_raw(), HandleKind::PipelineCache, "pipeline");
        }

        let signature = signature_of(&state, info);
        let raw = state.new_handle(HandleKind::Pipeline);
        if let Some(blob) = state.cache_blobs.get_mut(&cache.as_raw()) {
            blob.extend_from_slice(signature.as_bytes());
        }
        state.pipeline_signatures.insert(raw, signature);

        let pipeline = vk::Pipeline::from_raw(raw);
        state.record(Call::CreateGraphicsPipeline { pipeline, cache });
        Ok(pipeline)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = self.state.lock();
        if state.destroy(pipeline.as_raw(), HandleKind::Pipeline) {
            state.pipeline_signatures.remove(&pipeline.as_raw());
            state.record(Call::DestroyPipeline(pipeline));
        }
    }

    unsafe fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> VkResult<vk::RenderPass> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreateRenderPass)?;
        let raw = state.new_handle(HandleKind::RenderPass);
        let render_pass = vk::RenderPass::from_raw(raw);
        let dependencies = raw_slice(info.p_dependencies, info.dependency_count).to_vec();
        state.record(Call::CreateRenderPass {
            render_pass,
            attachments: info.attachment_count as usize,
            dependencies,
        });
        Ok(render_pass)
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state.lock();
        if state.destroy(render_pass.as_raw(), HandleKind::RenderPass) {
            state.record(Call::DestroyRenderPass(render_pass));
        }
    }

    unsafe fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreateFramebuffer)?;
        state.check_live(info.render_pass.as_raw(), HandleKind::RenderPass, "framebuffer");
        let views = raw_slice(info.p_attachments, info.attachment_count).to_vec();
        let raw = state.new_handle(HandleKind::Framebuffer);
        let framebuffer = vk::Framebuffer::from_raw(raw);
        state.record(Call::CreateFramebuffer {
            framebuffer,
            render_pass: info.render_pass,
            width: info.width,
            height: info.height,
            views,
        });
        Ok(framebuffer)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        if state.destroy(framebuffer.as_raw(), HandleKind::Framebuffer) {
            state.record(Call::DestroyFramebuffer(framebuffer));
        }
    }

    unsafe fn create_command_pool(
        &self,
        _info: &vk::CommandPoolCreateInfo<'_>,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreateCommandPool)?;
        let raw = state.new_handle(HandleKind::CommandPool);
        state.pool_buffers.insert(raw, Vec::new());
        let pool = vk::CommandPool::from_raw(raw);
        state.record(Call::CreateCommandPool(pool));
        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        let buffers = state.pool_buffers.remove(&pool.as_raw()).unwrap_or_default();
        for cmd in buffers {
            state.check_retired(cmd, "Destroying the pool of");
            state.live.remove(&cmd);
            state.recording.remove(&cmd);
        }
        if state.destroy(pool.as_raw(), HandleKind::CommandPool) {
            state.record(Call::DestroyCommandPool(pool));
        }
    }

    unsafe fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        state.fail(FailPoint::AllocateCommandBuffers)?;
        let pool = info.command_pool.as_raw();
        state.check_live(pool, HandleKind::CommandPool, "allocate");
        let raws: Vec<u64> = (0..info.command_buffer_count)
            .map(|_| state.new_handle(HandleKind::CommandBuffer))
            .collect();
        state.pool_buffers.entry(pool).or_default().extend(&raws);
        let buffers: Vec<_> = raws.into_iter().map(vk::CommandBuffer::from_raw).collect();
        state.record(Call::AllocateCommandBuffers(buffers.clone()));
        Ok(buffers)
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in buffers {
            state.check_retired(cmd.as_raw(), "Freeing");
            if state.destroy(cmd.as_raw(), HandleKind::CommandBuffer) {
                state.recording.remove(&cmd.as_raw());
                if let Some(owned) = state.pool_buffers.get_mut(&pool.as_raw()) {
                    owned.retain(|raw| *raw != cmd.as_raw());
                }
            }
        }
        state.record(Call::FreeCommandBuffers(buffers.to_vec()));
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.fail(FailPoint::BeginCommandBuffer)?;
        let raw = cmd.as_raw();
        state.check_live(raw, HandleKind::CommandBuffer, "begin");
        state.check_retired(raw, "Beginning");
        if !state.recording.insert(raw) {
            state.violation(format!("Command buffer {raw:#x} begun twice"));
        }
        state.record(Call::BeginCommandBuffer(cmd));
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.recording.remove(&cmd.as_raw()) {
            state.violation(format!(
                "Ending command buffer {:#x} that is not recording",
                cmd.as_raw()
            ));
        }
        state.record(Call::EndCommandBuffer(cmd));
        Ok(())
    }

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check_retired(cmd.as_raw(), "Resetting");
        state.recording.remove(&cmd.as_raw());
        state.record(Call::ResetCommandBuffer(cmd));
        Ok(())
    }

    unsafe fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
    ) {
        let mut state = self.state.lock();
        state.check_live(info.render_pass.as_raw(), HandleKind::RenderPass, "begin render pass");
        state.check_live(info.framebuffer.as_raw(), HandleKind::Framebuffer, "begin render pass");
        state.record(Call::BeginRenderPass {
            cmd,
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
            clear_values: info.clear_value_count as usize,
        });
    }

    unsafe fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.state.lock().record(Call::EndRenderPass(cmd));
    }

    unsafe fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        let mut state = self.state.lock();
        state.check_live(pipeline.as_raw(), HandleKind::Pipeline, "bind pipeline");
        state.record(Call::BindPipeline { cmd, pipeline });
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.state.lock().record(Call::BindDescriptorSets {
            cmd,
            sets: sets.len(),
        });
    }

    unsafe fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewports: &[vk::Viewport]) {
        let mut state = self.state.lock();
        for viewport in viewports {
            state.record(Call::SetViewport {
                cmd,
                viewport: *viewport,
            });
        }
    }

    unsafe fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissors: &[vk::Rect2D]) {
        let mut state = self.state.lock();
        for scissor in scissors {
            state.record(Call::SetScissor {
                cmd,
                scissor: *scissor,
            });
        }
    }

    unsafe fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        let mut state = self.state.lock();
        state.check_live(layout.as_raw(), HandleKind::PipelineLayout, "push constants");
        state.record(Call::PushConstants {
            cmd,
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    unsafe fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        _first_binding: u32,
        buffers: &[vk::Buffer],
        _offsets: &[vk::DeviceSize],
    ) {
        self.state.lock().record(Call::BindVertexBuffers {
            cmd,
            buffers: buffers.to_vec(),
        });
    }

    unsafe fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _index_type: vk::IndexType,
    ) {
        self.state
            .lock()
            .record(Call::BindIndexBuffer { cmd, buffer });
    }

    unsafe fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.state.lock().record(Call::Draw {
            cmd,
            vertex_count,
            instance_count,
        });
    }

    unsafe fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state.lock().record(Call::DrawIndexed {
            cmd,
            index_count,
            instance_count,
        });
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.state.lock();
        let src_memory = state.buffer_bindings.get(&src.as_raw()).copied();
        let dst_memory = state.buffer_bindings.get(&dst.as_raw()).copied();

        // Copies execute eagerly; submission order is not modelled.
        if let (Some(src_memory), Some(dst_memory)) = (src_memory, dst_memory) {
            for region in regions {
                let bytes = state.memory.get(&src_memory).map(|block| {
                    let start = region.src_offset as usize;
                    block.bytes[start..start + region.size as usize].to_vec()
                });
                if let (Some(bytes), Some(block)) = (bytes, state.memory.get_mut(&dst_memory)) {
                    let start = region.dst_offset as usize;
                    block.bytes[start..start + bytes.len()].copy_from_slice(&bytes);
                }
            }
        } else {
            state.violation("Copy between buffers without bound memory".to_string());
        }

        let size = regions.iter().map(|region| region.size).sum();
        state.record(Call::CopyBuffer {
            cmd,
            src,
            dst,
            size,
        });
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreateSemaphore)?;
        let semaphore = vk::Semaphore::from_raw(state.new_handle(HandleKind::Semaphore));
        state.semaphores.insert(semaphore.as_raw(), false);
        state.record(Call::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if state.destroy(semaphore.as_raw(), HandleKind::Semaphore) {
            state.semaphores.remove(&semaphore.as_raw());
            state.record(Call::DestroySemaphore(semaphore));
        }
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        state.fail(FailPoint::CreateFence)?;
        let raw = state.new_handle(HandleKind::Fence);
        state.fences.insert(
            raw,
            FenceState {
                signaled,
                pending: false,
            },
        );
        let fence = vk::Fence::from_raw(raw);
        state.record(Call::CreateFence { fence, signaled });
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fences.get(&fence.as_raw()).is_some_and(|f| f.pending) {
            state.violation(format!("Fence {:#x} destroyed while pending", fence.as_raw()));
        }
        if state.destroy(fence.as_raw(), HandleKind::Fence) {
            state.fences.remove(&fence.as_raw());
            state.record(Call::DestroyFence(fence));
        }
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.record(Call::WaitForFence { fence, timeout_ns });
        state.fail(FailPoint::WaitForFence)?;

        let raw = fence.as_raw();
        let status = state.fences.get(&raw).map(|f| (f.signaled, f.pending));
        let Some((signaled, pending)) = status else {
            state.violation(format!("Waiting on dead fence {raw:#x}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        };

        if signaled {
            Ok(())
        } else if pending {
            state.signal_fence(raw);
            Ok(())
        } else {
            state.violation(format!("Waiting on fence {raw:#x} that was never submitted"));
            Err(vk::Result::TIMEOUT)
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.fail(FailPoint::ResetFence)?;
        let mut pending = false;
        if let Some(f) = state.fences.get_mut(&fence.as_raw()) {
            pending = f.pending;
            f.signaled = false;
        }
        if pending {
            state.violation(format!("Resetting pending fence {:#x}", fence.as_raw()));
        }
        state.record(Call::ResetFence(fence));
        Ok(())
    }

    unsafe fn queue_submit(&self, queue: vk::Queue, submit: &QueueSubmit<'_>) -> VkResult<()> {
        let mut state = self.state.lock();
        state.fail(FailPoint::QueueSubmit)?;
        if queue != self.queue {
            state.violation("Submission to an unknown queue".to_string());
        }
        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            state.violation("Wait semaphores and stages differ in length".to_string());
        }

        for cmd in submit.command_buffers {
            let raw = cmd.as_raw();
            state.check_live(raw, HandleKind::CommandBuffer, "submit");
            state.check_retired(raw, "Submitting");
            if state.recording.contains(&raw) {
                state.violation(format!("Submitting command buffer {raw:#x} while recording"));
            }
        }

        let fence = submit.fence.as_raw();
        if fence != 0 {
            let status = state.fences.get_mut(&fence).map(|f| {
                let busy = f.signaled || f.pending;
                f.pending = true;
                busy
            });
            match status {
                Some(true) => {
                    state.violation(format!("Submitting with fence {fence:#x} not reset"));
                }
                Some(false) => {}
                None => state.violation(format!("Submitting with dead fence {fence:#x}")),
            }
        }

        for semaphore in submit.wait_semaphores {
            state.wait_semaphore(semaphore.as_raw(), "submit");
        }
        for semaphore in submit.signal_semaphores {
            state.signal_semaphore(semaphore.as_raw(), "submit");
        }

        let guard = (fence != 0).then_some(fence);
        for cmd in submit.command_buffers {
            state.in_flight.insert(cmd.as_raw(), guard);
        }

        state.record(Call::QueueSubmit {
            command_buffers: submit.command_buffers.to_vec(),
            wait_semaphores: submit.wait_semaphores.to_vec(),
            wait_stages: submit.wait_stages.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence: submit.fence,
        });
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        let mut state = self.state.lock();
        state.fail(FailPoint::QueueWaitIdle)?;
        state.retire_everything();
        state.record(Call::QueueWaitIdle);
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.fail(FailPoint::DeviceWaitIdle)?;
        state.retire_everything();
        state.record(Call::DeviceWaitIdle);
        Ok(())
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, len: u32) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len as usize)
    }
}

/// Everything about a pipeline that affects what it draws.
unsafe fn signature_of(state: &State, info: &vk::GraphicsPipelineCreateInfo<'_>) -> String {
    let stages: Vec<String> = raw_slice(info.p_stages, info.stage_count)
        .iter()
        .map(|stage| {
            let code = state.shader_code.get(&stage.module.as_raw());
            let entry = if stage.p_name.is_null() {
                String::new()
            } else {
                CStr::from_ptr(stage.p_name).to_string_lossy().into_owned()
            };
            format!("{:?}:{entry}:{code:?}", stage.stage)
        })
        .collect();

    let input_assembly = info
        .p_input_assembly_state
        .as_ref()
        .map(|s| (s.topology, s.primitive_restart_enable));
    let rasterization = info
        .p_rasterization_state
        .as_ref()
        .map(|s| (s.polygon_mode, s.cull_mode, s.front_face, s.line_width.to_bits()));
    let multisample = info
        .p_multisample_state
        .as_ref()
        .map(|s| s.rasterization_samples);
    let depth = info
        .p_depth_stencil_state
        .as_ref()
        .map(|s| (s.depth_test_enable, s.depth_write_enable, s.depth_compare_op));
    let blend: Option<Vec<String>> = info.p_color_blend_state.as_ref().map(|s| {
        raw_slice(s.p_attachments, s.attachment_count)
            .iter()
            .map(|a| {
                format!(
                    "{}:{:?}/{:?}/{:?}:{:?}/{:?}/{:?}:{:?}",
                    a.blend_enable,
                    a.src_color_blend_factor,
                    a.dst_color_blend_factor,
                    a.color_blend_op,
                    a.src_alpha_blend_factor,
                    a.dst_alpha_blend_factor,
                    a.alpha_blend_op,
                    a.color_write_mask
                )
            })
            .collect()
    });
    let vertex_input = info.p_vertex_input_state.as_ref().map(|s| {
        (
            s.vertex_binding_description_count,
            s.vertex_attribute_description_count,
        )
    });
    let dynamic = info
        .p_dynamic_state
        .as_ref()
        .map(|s| raw_slice(s.p_dynamic_states, s.dynamic_state_count).to_vec());

    format!(
        "stages={stages:?} vertex={vertex_input:?} assembly={input_assembly:?} \
         raster={rasterization:?} msaa={multisample:?} depth={depth:?} blend={blend:?} \
         dynamic={dynamic:?} render_pass={:#x} subpass={}",
        info.render_pass.as_raw(),
        info.subpass
    )
}
