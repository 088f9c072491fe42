//! Graphics pipeline state objects.

use crate::device::DeviceContext;
use crate::error::{GpuError, Result};
use crate::pipeline_cache::PipelineCacheRegistry;
use crate::render_pass::RenderPass;
use ash::vk;
use std::ffi::CString;
use std::io::Cursor;
use std::sync::Arc;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Compiled byte code for one shader stage.
#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub code: Vec<u32>,
    pub entry_point: CString,
}

impl ShaderStage {
    /// Stage from SPIR-V words with the `main` entry point.
    pub fn new(stage: vk::ShaderStageFlags, code: Vec<u32>) -> Self {
        Self {
            stage,
            code,
            entry_point: c"main".to_owned(),
        }
    }

    /// Stage from a SPIR-V byte blob, e.g. the contents of a `.spv` file.
    pub fn from_spirv_bytes(stage: vk::ShaderStageFlags, bytes: &[u8]) -> Result<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| GpuError::InvalidArgument(format!("Invalid SPIR-V blob: {e}")))?;

        match code.first() {
            Some(&SPIRV_MAGIC) => Ok(Self::new(stage, code)),
            Some(word) => Err(GpuError::InvalidArgument(format!(
                "SPIR-V magic mismatch: {word:#010x}"
            ))),
            None => Err(GpuError::InvalidArgument("Empty SPIR-V blob".to_string())),
        }
    }

    /// Use a different entry point.
    pub fn with_entry_point(mut self, entry_point: CString) -> Self {
        self.entry_point = entry_point;
        self
    }
}

/// Shader stages plus the interface metadata a default layout is built from.
#[derive(Debug, Clone, Default)]
pub struct ShaderSet {
    pub stages: Vec<ShaderStage>,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl ShaderSet {
    /// Vertex + fragment pair without descriptors or push constants.
    pub fn vertex_fragment(vertex: Vec<u32>, fragment: Vec<u32>) -> Self {
        Self {
            stages: vec![
                ShaderStage::new(vk::ShaderStageFlags::VERTEX, vertex),
                ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, fragment),
            ],
            ..Self::default()
        }
    }

    /// Add a push-constant range.
    pub fn with_push_constants(
        mut self,
        stages: vk::ShaderStageFlags,
        offset: u32,
        size: u32,
    ) -> Self {
        self.push_constant_ranges.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
        self
    }

    /// Add a descriptor set layout.
    pub fn with_set_layout(mut self, layout: vk::DescriptorSetLayout) -> Self {
        self.set_layouts.push(layout);
        self
    }
}

/// Explicit pipeline layout description, overriding the shader set's metadata.
#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutDesc {
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}

/// Vertex buffer bindings and attributes. Empty by default.
#[derive(Debug, Clone, Default)]
pub struct VertexInputLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// Primitive assembly. Defaults to a triangle list without restart.
#[derive(Debug, Clone, Copy)]
pub struct InputAssemblyConfig {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
}

impl Default for InputAssemblyConfig {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
        }
    }
}

/// Rasterizer state. Defaults to filled, back-face culled, counter-clockwise front faces.
#[derive(Debug, Clone, Copy)]
pub struct RasterizationConfig {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub depth_clamp: bool,
}

impl Default for RasterizationConfig {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            depth_clamp: false,
        }
    }
}

/// Multisample state. Defaults to single-sample without sample shading.
#[derive(Debug, Clone, Copy)]
pub struct MultisampleConfig {
    pub samples: vk::SampleCountFlags,
    /// Minimum sample shading fraction; `None` disables sample shading.
    pub sample_shading: Option<f32>,
}

impl Default for MultisampleConfig {
    fn default() -> Self {
        Self {
            samples: vk::SampleCountFlags::TYPE_1,
            sample_shading: None,
        }
    }
}

/// Depth test state. Defaults to test and write with `LESS_OR_EQUAL`.
#[derive(Debug, Clone, Copy)]
pub struct DepthStencilConfig {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthStencilConfig {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
        }
    }
}

/// Color blend equation applied to every color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendState {
    pub enabled: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
    pub write_mask: vk::ColorComponentFlags,
}

impl BlendState {
    /// Blending for colors already multiplied by their alpha.
    pub const fn premultiplied_alpha() -> Self {
        Self {
            enabled: true,
            src_color: vk::BlendFactor::ONE,
            dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_op: vk::BlendOp::ADD,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }

    /// Classic straight-alpha blending.
    pub const fn alpha() -> Self {
        Self {
            src_color: vk::BlendFactor::SRC_ALPHA,
            ..Self::premultiplied_alpha()
        }
    }

    /// No blending; fragments overwrite the target.
    pub const fn opaque() -> Self {
        Self {
            enabled: false,
            src_color: vk::BlendFactor::ONE,
            dst_color: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }

    fn attachment_state(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(self.enabled)
            .src_color_blend_factor(self.src_color)
            .dst_color_blend_factor(self.dst_color)
            .color_blend_op(self.color_op)
            .src_alpha_blend_factor(self.src_alpha)
            .dst_alpha_blend_factor(self.dst_alpha)
            .alpha_blend_op(self.alpha_op)
            .color_write_mask(self.write_mask)
    }
}

impl Default for BlendState {
    fn default() -> Self {
        Self::premultiplied_alpha()
    }
}

/// Fixed-function configuration of a graphics pipeline.
///
/// Every sub-state has its own default and is applied independently of the
/// others. Empty `viewports`/`scissors` fall back to the render pass's.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub viewports: Vec<vk::Viewport>,
    pub scissors: Vec<vk::Rect2D>,
    /// Explicit layout; `None` builds it from the shader set's metadata.
    pub layout: Option<PipelineLayoutDesc>,
    pub vertex_input: VertexInputLayout,
    pub input_assembly: InputAssemblyConfig,
    pub rasterization: RasterizationConfig,
    pub multisample: MultisampleConfig,
    /// Defaults to viewport and scissor.
    pub dynamic_states: Vec<vk::DynamicState>,
    /// `None` disables depth testing entirely.
    pub depth_stencil: Option<DepthStencilConfig>,
    pub blend: BlendState,
    pub blend_constants: [f32; 4],
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            viewports: Vec::new(),
            scissors: Vec::new(),
            layout: None,
            vertex_input: VertexInputLayout::default(),
            input_assembly: InputAssemblyConfig::default(),
            rasterization: RasterizationConfig::default(),
            multisample: MultisampleConfig::default(),
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            depth_stencil: Some(DepthStencilConfig::default()),
            blend: BlendState::default(),
            blend_constants: [0.0; 4],
        }
    }
}

impl PipelineConfig {
    /// Replace the vertex input layout.
    pub fn with_vertex_input(mut self, vertex_input: VertexInputLayout) -> Self {
        self.vertex_input = vertex_input;
        self
    }

    /// Replace the blend state.
    pub fn with_blend(mut self, blend: BlendState) -> Self {
        self.blend = blend;
        self
    }

    /// Replace or disable the depth state.
    pub fn with_depth_stencil(mut self, depth_stencil: Option<DepthStencilConfig>) -> Self {
        self.depth_stencil = depth_stencil;
        self
    }

    /// Replace the rasterizer state.
    pub fn with_rasterization(mut self, rasterization: RasterizationConfig) -> Self {
        self.rasterization = rasterization;
        self
    }

    /// Replace the multisample state.
    pub fn with_multisample(mut self, multisample: MultisampleConfig) -> Self {
        self.multisample = multisample;
        self
    }

    /// Use an explicit layout.
    pub fn with_layout(mut self, layout: PipelineLayoutDesc) -> Self {
        self.layout = Some(layout);
        self
    }
}

/// Create a pipeline layout from descriptor set layouts and push-constant ranges.
pub fn create_pipeline_layout(
    device: &dyn DeviceContext,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);

    unsafe { device.create_pipeline_layout(&layout_info) }
        .map_err(|e| GpuError::creation("pipeline layout", e))
}

/// An immutable graphics pipeline and its layout.
pub struct Pipeline {
    device: Arc<dyn DeviceContext>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl Pipeline {
    /// Build a graphics pipeline for subpass 0 of `render_pass`.
    ///
    /// The cache named `cache_name` is used when the registry has one for this
    /// device; otherwise the pipeline is built without a cache. Shader modules
    /// only live for the duration of the call.
    pub fn load(
        device: &Arc<dyn DeviceContext>,
        caches: &PipelineCacheRegistry,
        cache_name: &str,
        render_pass: &RenderPass,
        shaders: &ShaderSet,
        config: &PipelineConfig,
    ) -> Result<Self> {
        if render_pass.handle() == vk::RenderPass::null() {
            return Err(GpuError::InvalidArgument(
                "Pipeline needs a live render pass".to_string(),
            ));
        }
        if shaders.stages.is_empty() {
            return Err(GpuError::InvalidArgument(
                "Pipeline needs at least one shader stage".to_string(),
            ));
        }

        let (set_layouts, push_constant_ranges) = match &config.layout {
            Some(desc) => (&desc.set_layouts, &desc.push_constant_ranges),
            None => (&shaders.set_layouts, &shaders.push_constant_ranges),
        };

        let mut modules = Vec::with_capacity(shaders.stages.len());
        for stage in &shaders.stages {
            match unsafe { device.create_shader_module(&stage.code) } {
                Ok(module) => modules.push(module),
                Err(e) => {
                    tracing::error!("Creating {:?} shader module failed: {e}", stage.stage);
                    destroy_modules(device.as_ref(), &modules);
                    return Err(GpuError::creation("shader module", e));
                }
            }
        }

        let layout =
            match create_pipeline_layout(device.as_ref(), set_layouts, push_constant_ranges) {
                Ok(layout) => layout,
                Err(e) => {
                    destroy_modules(device.as_ref(), &modules);
                    return Err(e);
                }
            };

        let cache = caches.get_pipeline_cache(device.id(), cache_name);
        if cache == vk::PipelineCache::null() {
            tracing::debug!("No pipeline cache '{cache_name}', building uncached");
        }

        let result = build_pipeline(
            device.as_ref(),
            cache,
            layout,
            &modules,
            render_pass,
            shaders,
            config,
        );
        destroy_modules(device.as_ref(), &modules);

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Creating graphics pipeline on {} failed: {e}", device.name());
                unsafe { device.destroy_pipeline_layout(layout) };
                return Err(GpuError::creation("graphics pipeline", e));
            }
        };

        tracing::debug!(
            "Graphics pipeline with {} stages created on {}",
            shaders.stages.len(),
            device.name()
        );

        Ok(Self {
            device: Arc::clone(device),
            handle,
            layout,
            push_constant_ranges: push_constant_ranges.clone(),
        })
    }

    /// Bind the pipeline and, if any, descriptor sets starting at set 0.
    ///
    /// # Safety
    /// `cmd` must be recording on this pipeline's device.
    pub unsafe fn bind(&self, cmd: vk::CommandBuffer, descriptor_sets: &[vk::DescriptorSet]) {
        self.device.cmd_bind_pipeline(cmd, self.handle);
        if !descriptor_sets.is_empty() {
            self.device
                .cmd_bind_descriptor_sets(cmd, self.layout, 0, descriptor_sets);
        }
    }

    /// Raw pipeline handle; null after release.
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    /// Raw layout handle; null after release.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Push-constant ranges the layout was built with.
    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }

    /// Union of the stages of every push-constant range.
    pub fn push_constant_stages(&self) -> vk::ShaderStageFlags {
        self.push_constant_ranges
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |acc, range| {
                acc | range.stage_flags
            })
    }

    /// Destroy the pipeline, then its layout. Calling this again is a no-op.
    pub fn release(&mut self) {
        if self.handle != vk::Pipeline::null() {
            unsafe { self.device.destroy_pipeline(self.handle) };
            self.handle = vk::Pipeline::null();
        }
        if self.layout != vk::PipelineLayout::null() {
            unsafe { self.device.destroy_pipeline_layout(self.layout) };
            self.layout = vk::PipelineLayout::null();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.release();
    }
}

fn destroy_modules(device: &dyn DeviceContext, modules: &[vk::ShaderModule]) {
    for &module in modules {
        unsafe { device.destroy_shader_module(module) };
    }
}

fn build_pipeline(
    device: &dyn DeviceContext,
    cache: vk::PipelineCache,
    layout: vk::PipelineLayout,
    modules: &[vk::ShaderModule],
    render_pass: &RenderPass,
    shaders: &ShaderSet,
    config: &PipelineConfig,
) -> ash::prelude::VkResult<vk::Pipeline> {
    let stages: Vec<_> = shaders
        .stages
        .iter()
        .zip(modules)
        .map(|(stage, &module)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage.stage)
                .module(module)
                .name(&stage.entry_point)
        })
        .collect();

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&config.vertex_input.bindings)
        .vertex_attribute_descriptions(&config.vertex_input.attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(config.input_assembly.topology)
        .primitive_restart_enable(config.input_assembly.primitive_restart);

    let viewports = if config.viewports.is_empty() {
        vec![render_pass.viewport()]
    } else {
        config.viewports.clone()
    };
    let scissors = if config.scissors.is_empty() {
        vec![render_pass.scissor()]
    } else {
        config.scissors.clone()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewports(&viewports)
        .scissors(&scissors);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(config.rasterization.depth_clamp)
        .rasterizer_discard_enable(false)
        .polygon_mode(config.rasterization.polygon_mode)
        .cull_mode(config.rasterization.cull_mode)
        .front_face(config.rasterization.front_face)
        .depth_bias_enable(false)
        .line_width(config.rasterization.line_width);

    let mut multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(config.multisample.samples);
    if let Some(min) = config.multisample.sample_shading {
        multisample = multisample
            .sample_shading_enable(true)
            .min_sample_shading(min);
    }

    let depth = config.depth_stencil.unwrap_or(DepthStencilConfig {
        depth_test: false,
        depth_write: false,
        compare_op: vk::CompareOp::ALWAYS,
    });
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(depth.depth_test)
        .depth_write_enable(depth.depth_write)
        .depth_compare_op(depth.compare_op)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0);

    let blend_attachments =
        vec![config.blend.attachment_state(); render_pass.color_attachment_count()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&blend_attachments)
        .blend_constants(config.blend_constants);

    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&config.dynamic_states);

    let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass.handle())
        .subpass(0);
    if render_pass.has_depth() {
        pipeline_info = pipeline_info.depth_stencil_state(&depth_stencil);
    }

    unsafe { device.create_graphics_pipeline(cache, &pipeline_info) }
}
