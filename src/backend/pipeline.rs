// Graphics pipeline creation
//
// The graphics pipeline defines how vertices are processed and rasterized.
// GraphicsPipelineBuilder collects every state group, checking optional
// hardware features as each setter is called: an unsupported request is
// replaced by something the GPU can do and logged, never turned into an
// error. build() bakes the result into one immutable GraphicsPipeline and
// registers it with the target render pass.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use super::capabilities::DeviceCapabilities;
use super::device::VirtualDevice;
use super::render_pass::RenderPass;
use super::shader;
use crate::logging::{Logger, Severity};

/// Standard "over" blending on all four channels
pub fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

/// Create flags, base handle and base index for a pipeline that may be a
/// base for others and/or derive from `base`.
pub fn derivative_setup(
    allow_derivatives: bool,
    base: Option<vk::Pipeline>,
) -> (vk::PipelineCreateFlags, vk::Pipeline, i32) {
    let mut flags = vk::PipelineCreateFlags::empty();
    if allow_derivatives {
        flags = flags | vk::PipelineCreateFlags::ALLOW_DERIVATIVES;
    }

    match base {
        Some(handle) => (flags | vk::PipelineCreateFlags::DERIVATIVE, handle, -1),
        None => (flags, vk::Pipeline::null(), -1),
    }
}

struct ShaderStage {
    stage: vk::ShaderStageFlags,
    code: Vec<u32>,
    entry_point: usize,
}

pub struct GraphicsPipelineBuilder<'a> {
    name: String,
    caps: &'a DeviceCapabilities,
    logger: &'a dyn Logger,

    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    topology: vk::PrimitiveTopology,
    primitive_restart: bool,

    viewport_count: u32,
    scissor_count: u32,

    depth_clamp: bool,
    rasterizer_discard: bool,
    polygon_mode: vk::PolygonMode,
    line_width: f32,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    depth_bias_enable: bool,
    depth_bias_constant_factor: f32,
    depth_bias_clamp: f32,
    depth_bias_slope_factor: f32,

    sample_shading: bool,
    rasterization_samples: vk::SampleCountFlags,
    min_sample_shading: f32,
    sample_mask: Vec<vk::SampleMask>,
    alpha_to_coverage: bool,
    alpha_to_one: bool,

    depth_test: bool,
    depth_write: bool,
    depth_compare_op: vk::CompareOp,
    depth_bounds_test: bool,
    min_depth_bounds: f32,
    max_depth_bounds: f32,
    stencil_test: bool,
    stencil_front: vk::StencilOpState,
    stencil_back: vk::StencilOpState,

    patch_control_points: Option<u32>,

    color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    logic_op_enable: bool,
    logic_op: vk::LogicOp,
    blend_constants: [f32; 4],

    dynamic_states: Vec<vk::DynamicState>,

    stages: Vec<ShaderStage>,
    // Each CString owns its own allocation, so pointers taken during build()
    // stay valid no matter how many stages were pushed after them
    entry_points: Vec<CString>,

    descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constant_ranges: Vec<vk::PushConstantRange>,

    allow_derivatives: bool,
    base_pipeline: Option<Rc<GraphicsPipeline>>,
    render_pass: Option<Rc<RenderPass>>,
    subpass: u32,
}

impl<'a> GraphicsPipelineBuilder<'a> {
    /// Usually obtained through `VirtualDevice::graphics_pipeline_builder`
    pub fn new(name: &str, caps: &'a DeviceCapabilities, logger: &'a dyn Logger) -> Self {
        Self {
            name: name.to_string(),
            caps,
            logger,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            viewport_count: 1,
            scissor_count: 1,
            depth_clamp: false,
            rasterizer_discard: false,
            polygon_mode: vk::PolygonMode::FILL,
            line_width: 1.0,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_bias_enable: false,
            depth_bias_constant_factor: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope_factor: 0.0,
            sample_shading: false,
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            min_sample_shading: 0.0,
            sample_mask: Vec::new(),
            alpha_to_coverage: false,
            alpha_to_one: false,
            depth_test: false,
            depth_write: false,
            depth_compare_op: vk::CompareOp::LESS,
            depth_bounds_test: false,
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
            stencil_test: false,
            stencil_front: vk::StencilOpState::default(),
            stencil_back: vk::StencilOpState::default(),
            patch_control_points: None,
            color_blend_attachments: Vec::new(),
            logic_op_enable: false,
            logic_op: vk::LogicOp::COPY,
            blend_constants: [0.0; 4],
            dynamic_states: Vec::new(),
            stages: Vec::new(),
            entry_points: Vec::new(),
            descriptor_set_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
            allow_derivatives: false,
            base_pipeline: None,
            render_pass: None,
            subpass: 0,
        }
    }

    fn downgrade(&self, severity: Severity, message: String) {
        self.logger.rendering(
            severity,
            &format!("The enabled GPU \"{}\" {}", self.caps.device_name, message),
        );
    }

    fn supports(feature: vk::Bool32) -> bool {
        feature == vk::TRUE
    }

    // Vertex input

    pub fn add_vertex_binding(&mut self, binding: vk::VertexInputBindingDescription) -> &mut Self {
        self.vertex_bindings.push(binding);
        self
    }

    pub fn add_vertex_attribute(&mut self, attribute: vk::VertexInputAttributeDescription) -> &mut Self {
        self.vertex_attributes.push(attribute);
        self
    }

    pub fn set_primitive_topology(&mut self, topology: vk::PrimitiveTopology) -> &mut Self {
        self.topology = topology;
        self
    }

    pub fn set_primitive_restart(&mut self, enable: bool) -> &mut Self {
        self.primitive_restart = enable;
        self
    }

    // Viewports

    fn negotiate_viewport_count(&self, what: &str, requested: u32) -> u32 {
        if requested > 1 && !Self::supports(self.caps.features.multi_viewport) {
            self.downgrade(
                Severity::Warning,
                format!(
                    "does not support multiple viewports. Requested {} {}, using 1.",
                    requested, what
                ),
            );
            return 1;
        }

        let max = self.caps.limits.max_viewports.max(1);
        if requested > max {
            self.downgrade(
                Severity::Warning,
                format!(
                    "supports at most {} viewports. Requested {} {}, using {}.",
                    max, requested, what, max
                ),
            );
            return max;
        }

        requested
    }

    pub fn set_viewport_count(&mut self, count: u32) -> &mut Self {
        self.viewport_count = self.negotiate_viewport_count("viewports", count);
        self
    }

    pub fn set_scissor_count(&mut self, count: u32) -> &mut Self {
        self.scissor_count = self.negotiate_viewport_count("scissors", count);
        self
    }

    // Rasterizer

    pub fn set_depth_clamp_enable(&mut self, enable: bool) -> &mut Self {
        if enable && !Self::supports(self.caps.features.depth_clamp) {
            self.downgrade(
                Severity::Info,
                "does not support depth clamping. Hardware depth clamping will be disabled.".to_string(),
            );
            self.depth_clamp = false;
        } else {
            self.depth_clamp = enable;
        }
        self
    }

    pub fn set_rasterizer_discard_enable(&mut self, enable: bool) -> &mut Self {
        self.rasterizer_discard = enable;
        self
    }

    pub fn set_polygon_mode(&mut self, mode: vk::PolygonMode) -> &mut Self {
        if mode == vk::PolygonMode::FILL || Self::supports(self.caps.features.fill_mode_non_solid) {
            self.polygon_mode = mode;
        } else {
            self.downgrade(
                Severity::Warning,
                format!(
                    "does not support the polygon mode {:?}. Falling back to {:?}.",
                    mode,
                    vk::PolygonMode::FILL
                ),
            );
            self.polygon_mode = vk::PolygonMode::FILL;
        }
        self
    }

    pub fn set_line_width(&mut self, requested: f32) -> &mut Self {
        if Self::supports(self.caps.features.wide_lines) {
            let [min, max] = self.caps.limits.line_width_range;
            self.line_width = requested.max(min).min(max);
            if self.line_width != requested {
                self.downgrade(
                    Severity::Warning,
                    format!(
                        "does not support {} width lines. Clamping to supported range [{}, {}]: using {}.",
                        requested, min, max, self.line_width
                    ),
                );
            }
        } else {
            if requested != 1.0 {
                self.downgrade(
                    Severity::Warning,
                    format!(
                        "does not support wide lines. Requested {} width lines, falling back to 1.0.",
                        requested
                    ),
                );
            }
            self.line_width = 1.0;
        }
        self
    }

    pub fn set_cull_mode(&mut self, cull_mode: vk::CullModeFlags) -> &mut Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn set_front_face(&mut self, front_face: vk::FrontFace) -> &mut Self {
        self.front_face = front_face;
        self
    }

    pub fn set_depth_bias(
        &mut self,
        enable: bool,
        constant_factor: f32,
        clamp: f32,
        slope_factor: f32,
    ) -> &mut Self {
        self.depth_bias_enable = enable;
        self.depth_bias_constant_factor = constant_factor;
        self.depth_bias_clamp = clamp;
        self.depth_bias_slope_factor = slope_factor;
        self
    }

    // Multisampling

    /// Rasterization samples are negotiated against the depth/stencil test
    /// state at the time of the call, so enable those tests first.
    pub fn set_multisampling(
        &mut self,
        sample_shading: bool,
        samples: vk::SampleCountFlags,
        min_sample_shading: f32,
        sample_mask: &[vk::SampleMask],
        alpha_to_coverage: bool,
        alpha_to_one: bool,
    ) -> &mut Self {
        if sample_shading && !Self::supports(self.caps.features.sample_rate_shading) {
            self.downgrade(
                Severity::Warning,
                format!(
                    "does not support sample rate shading. Sample rate shading will be disabled and minimum sample shading will fall back to 0.0 (requested {}).",
                    min_sample_shading
                ),
            );
            self.sample_shading = false;
        } else {
            self.sample_shading = sample_shading;
        }

        self.min_sample_shading = if self.sample_shading {
            min_sample_shading.clamp(0.0, 1.0)
        } else {
            0.0
        };

        self.rasterization_samples = self.caps.multisampling_samples_fallback(
            samples,
            self.depth_test,
            self.stencil_test,
        );
        if self.rasterization_samples != samples {
            self.downgrade(
                Severity::Info,
                format!(
                    "does not support {} rasterization samples with the current depth/stencil usage. Falling back to {} samples.",
                    samples.as_raw(),
                    self.rasterization_samples.as_raw()
                ),
            );
        }

        self.sample_mask = sample_mask.to_vec();
        self.alpha_to_coverage = alpha_to_coverage;

        if alpha_to_one && !Self::supports(self.caps.features.alpha_to_one) {
            self.downgrade(
                Severity::Warning,
                "does not support alpha to one. Alpha to one will be disabled.".to_string(),
            );
            self.alpha_to_one = false;
        } else {
            self.alpha_to_one = alpha_to_one;
        }
        self
    }

    // Depth and stencil

    pub fn set_depth_test_enable(&mut self, enable: bool) -> &mut Self {
        self.depth_test = enable;
        self
    }

    pub fn set_depth_write_enable(&mut self, enable: bool) -> &mut Self {
        self.depth_write = enable;
        self
    }

    pub fn set_depth_compare_op(&mut self, op: vk::CompareOp) -> &mut Self {
        self.depth_compare_op = op;
        self
    }

    pub fn set_depth_bounds_test_enable(&mut self, enable: bool) -> &mut Self {
        if enable && !Self::supports(self.caps.features.depth_bounds) {
            self.downgrade(
                Severity::Warning,
                "does not support depth bounds testing. The depth bounds test will be disabled.".to_string(),
            );
            self.depth_bounds_test = false;
        } else {
            self.depth_bounds_test = enable;
        }
        self
    }

    pub fn set_depth_bounds(&mut self, min: f32, max: f32) -> &mut Self {
        self.min_depth_bounds = min;
        self.max_depth_bounds = max;
        self
    }

    pub fn set_stencil_test_enable(&mut self, enable: bool) -> &mut Self {
        self.stencil_test = enable;
        self
    }

    pub fn set_stencil_ops(&mut self, front: vk::StencilOpState, back: vk::StencilOpState) -> &mut Self {
        self.stencil_front = front;
        self.stencil_back = back;
        self
    }

    // Tessellation

    pub fn set_tessellation_patch_control_points(&mut self, points: u32) -> &mut Self {
        if Self::supports(self.caps.features.tessellation_shader) {
            self.patch_control_points = Some(points);
        } else {
            self.downgrade(
                Severity::Warning,
                format!(
                    "does not support tessellation shaders. Ignoring {} patch control points.",
                    points
                ),
            );
            self.patch_control_points = None;
        }
        self
    }

    // Color blending

    /// One entry per color attachment of the target subpass
    pub fn add_color_blend_attachment(
        &mut self,
        attachment: vk::PipelineColorBlendAttachmentState,
    ) -> &mut Self {
        self.color_blend_attachments.push(attachment);
        self
    }

    pub fn set_color_blend_logical_op(&mut self, enable: bool, op: vk::LogicOp) -> &mut Self {
        if enable && !Self::supports(self.caps.features.logic_op) {
            self.downgrade(
                Severity::Warning,
                format!(
                    "does not support blend logic operations. Logic op {:?} will be disabled.",
                    op
                ),
            );
            self.logic_op_enable = false;
        } else {
            self.logic_op_enable = enable;
        }
        self.logic_op = op;
        self
    }

    pub fn set_color_blend_constants(&mut self, constants: [f32; 4]) -> &mut Self {
        self.blend_constants = constants;
        self
    }

    pub fn add_dynamic_state(&mut self, state: vk::DynamicState) -> &mut Self {
        if !self.dynamic_states.contains(&state) {
            self.dynamic_states.push(state);
        }
        self
    }

    // Shaders and layout

    /// Load a compiled SPIR-V shader for `stage`. Fails if the file cannot
    /// be read or is not SPIR-V.
    pub fn add_stage(
        &mut self,
        path: impl AsRef<Path>,
        entry_point: &str,
        stage: vk::ShaderStageFlags,
    ) -> Result<&mut Self> {
        let path = path.as_ref();
        let code = shader::read_binary(path)?;
        let entry_point = CString::new(entry_point)
            .with_context(|| format!("Invalid entry point name for {}", path.display()))?;

        self.entry_points.push(entry_point);
        self.stages.push(ShaderStage {
            stage,
            code,
            entry_point: self.entry_points.len() - 1,
        });
        Ok(self)
    }

    pub fn add_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) -> &mut Self {
        self.descriptor_set_layouts.push(layout);
        self
    }

    pub fn add_push_constant_range(&mut self, range: vk::PushConstantRange) -> &mut Self {
        self.push_constant_ranges.push(range);
        self
    }

    // Derivatives and target

    /// Allow later pipelines to derive from this one
    pub fn set_allow_derivatives(&mut self, allow: bool) -> &mut Self {
        self.allow_derivatives = allow;
        self
    }

    /// Derive from `base`, which must have been built with derivatives allowed
    pub fn set_base_pipeline(&mut self, base: Rc<GraphicsPipeline>) -> &mut Self {
        if base.allows_derivatives() {
            self.base_pipeline = Some(base);
        } else {
            self.logger.rendering(
                Severity::Warning,
                &format!(
                    "Pipeline \"{}\" cannot derive from \"{}\", which was built without derivatives allowed.",
                    self.name,
                    base.name()
                ),
            );
            self.base_pipeline = None;
        }
        self
    }

    pub fn set_render_pass(&mut self, render_pass: Rc<RenderPass>, subpass: u32) -> &mut Self {
        self.render_pass = Some(render_pass);
        self.subpass = subpass;
        self
    }

    /// Create the pipeline and register it with its render pass. Failures
    /// are logged FATAL and returned; shader modules never outlive this call.
    pub fn build(self, device: &Arc<VirtualDevice>) -> Result<Rc<GraphicsPipeline>> {
        debug_assert!(
            std::ptr::eq(self.caps, device.capabilities()),
            "pipeline builder used with a different device"
        );

        let render_pass = match self.validate_target() {
            Ok(render_pass) => render_pass,
            Err(e) => {
                self.fatal(&e);
                return Err(e);
            }
        };

        let mut modules = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            match shader::create_shader_module(&device.device, &stage.code) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    Self::destroy_modules(device, &modules);
                    self.fatal(&e);
                    return Err(e);
                }
            }
        }

        let result = self.create_pipeline(device, &render_pass, &modules);
        Self::destroy_modules(device, &modules);

        let pipeline = match result {
            Ok(pipeline) => Rc::new(pipeline),
            Err(e) => {
                self.fatal(&e);
                return Err(e);
            }
        };

        log::info!(
            "Created graphics pipeline \"{}\" for render pass \"{}\" subpass {}",
            self.name,
            render_pass.name(),
            self.subpass
        );

        render_pass.register_pipeline(self.subpass, pipeline.clone());
        Ok(pipeline)
    }

    fn fatal(&self, error: &anyhow::Error) {
        self.logger.rendering(
            Severity::Fatal,
            &format!(
                "Failed to build graphics pipeline \"{}\" on GPU \"{}\": {:#}",
                self.name, self.caps.device_name, error
            ),
        );
    }

    fn destroy_modules(device: &VirtualDevice, modules: &[vk::ShaderModule]) {
        for &module in modules {
            unsafe { device.device.destroy_shader_module(module, None) };
        }
    }

    fn validate_target(&self) -> Result<Rc<RenderPass>> {
        let render_pass = self
            .render_pass
            .clone()
            .context("no target render pass was set")?;

        if self.subpass >= render_pass.subpass_count() {
            anyhow::bail!(
                "subpass {} does not exist in render pass \"{}\" ({} subpasses)",
                self.subpass,
                render_pass.name(),
                render_pass.subpass_count()
            );
        }

        if self.stages.is_empty() {
            anyhow::bail!("no shader stages were added");
        }

        Ok(render_pass)
    }

    fn create_pipeline(
        &self,
        device: &Arc<VirtualDevice>,
        render_pass: &RenderPass,
        modules: &[vk::ShaderModule],
    ) -> Result<GraphicsPipeline> {
        let shader_stages: Vec<_> = self
            .stages
            .iter()
            .zip(modules)
            .map(|(stage, &module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(module)
                    .name(&self.entry_points[stage.entry_point])
                    .build()
            })
            .collect();

        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&self.vertex_bindings)
            .vertex_attribute_descriptions(&self.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.topology)
            .primitive_restart_enable(self.primitive_restart);

        // Viewports and scissors are supplied at draw time
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            viewport_count: self.viewport_count,
            scissor_count: self.scissor_count,
            ..Default::default()
        };

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(self.depth_clamp)
            .rasterizer_discard_enable(self.rasterizer_discard)
            .polygon_mode(self.polygon_mode)
            .line_width(self.line_width)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .depth_bias_enable(self.depth_bias_enable)
            .depth_bias_constant_factor(self.depth_bias_constant_factor)
            .depth_bias_clamp(self.depth_bias_clamp)
            .depth_bias_slope_factor(self.depth_bias_slope_factor);

        let mut multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(self.sample_shading)
            .rasterization_samples(self.rasterization_samples)
            .min_sample_shading(self.min_sample_shading)
            .alpha_to_coverage_enable(self.alpha_to_coverage)
            .alpha_to_one_enable(self.alpha_to_one);
        if !self.sample_mask.is_empty() {
            multisampling = multisampling.sample_mask(&self.sample_mask);
        }

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(self.depth_compare_op)
            .depth_bounds_test_enable(self.depth_bounds_test)
            .min_depth_bounds(self.min_depth_bounds)
            .max_depth_bounds(self.max_depth_bounds)
            .stencil_test_enable(self.stencil_test)
            .front(self.stencil_front)
            .back(self.stencil_back);

        let tessellation = self.patch_control_points.map(|points| {
            vk::PipelineTessellationStateCreateInfo::builder()
                .patch_control_points(points)
                .build()
        });

        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(self.logic_op_enable)
            .logic_op(self.logic_op)
            .attachments(&self.color_blend_attachments)
            .blend_constants(self.blend_constants);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&self.dynamic_states);

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&self.descriptor_set_layouts)
            .push_constant_ranges(&self.push_constant_ranges);

        let layout = unsafe {
            device
                .device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")?
        };

        let (flags, base_handle, base_index) = derivative_setup(
            self.allow_derivatives,
            self.base_pipeline.as_ref().map(|base| base.handle()),
        );

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .flags(flags)
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.handle())
            .subpass(self.subpass)
            .base_pipeline_handle(base_handle)
            .base_pipeline_index(base_index);
        if let Some(tessellation) = tessellation.as_ref() {
            pipeline_info = pipeline_info.tessellation_state(tessellation);
        }

        let pipelines = unsafe {
            device.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info.build()],
                None,
            )
        };

        let pipeline = match pipelines {
            Ok(pipelines) => pipelines.into_iter().next(),
            Err((_, e)) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                return Err(e).context("Failed to create graphics pipeline");
            }
        };

        let Some(pipeline) = pipeline else {
            unsafe { device.device.destroy_pipeline_layout(layout, None) };
            anyhow::bail!("Driver returned no graphics pipeline");
        };

        Ok(GraphicsPipeline {
            pipeline,
            layout,
            name: self.name.clone(),
            allows_derivatives: self.allow_derivatives,
            device: device.clone(),
        })
    }
}

/// An immutable pipeline and its layout, destroyed together
pub struct GraphicsPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    name: String,
    allows_derivatives: bool,
    device: Arc<VirtualDevice>,
}

impl GraphicsPipeline {
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allows_derivatives(&self) -> bool {
        self.allows_derivatives
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        log::info!("Destroying graphics pipeline \"{}\"...", self.name);
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{Domain, RENDERING_PIPE};
    use crate::test_support::{capable_gpu, minimal_gpu, RecordingLogger};
    use ash::vk::Handle;
    use std::path::PathBuf;

    fn spirv_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tritium-pipeline-{}-{}", std::process::id(), name));
        let mut bytes = Vec::new();
        for word in [0x0723_0203u32, 0x0001_0000, 0, 1, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn viewport_count_forced_to_one_without_multi_viewport() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_viewport_count(4).set_scissor_count(3);
        assert_eq!(builder.viewport_count, 1);
        assert_eq!(builder.scissor_count, 1);
        assert_eq!(logger.count(Severity::Warning), 2);
    }

    #[test]
    fn viewport_count_clamped_to_device_limit() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_viewport_count(4);
        assert_eq!(builder.viewport_count, 4);
        assert!(logger.records().is_empty());

        builder.set_viewport_count(32);
        assert_eq!(builder.viewport_count, 16);
        assert_eq!(logger.count(Severity::Warning), 1);
    }

    #[test]
    fn line_width_is_one_without_wide_lines() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_line_width(1.0);
        assert_eq!(builder.line_width, 1.0);
        assert!(logger.records().is_empty());

        builder.set_line_width(2.5);
        assert_eq!(builder.line_width, 1.0);
        assert_eq!(logger.count(Severity::Warning), 1);
    }

    #[test]
    fn line_width_is_clamped_into_device_range() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_line_width(3.0);
        assert_eq!(builder.line_width, 3.0);
        assert!(logger.records().is_empty());

        builder.set_line_width(12.0);
        assert_eq!(builder.line_width, 8.0);

        builder.set_line_width(0.5);
        assert_eq!(builder.line_width, 1.0);
        assert_eq!(logger.count(Severity::Warning), 2);
    }

    #[test]
    fn non_solid_polygon_modes_fall_back_to_fill() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_polygon_mode(vk::PolygonMode::LINE);
        assert_eq!(builder.polygon_mode, vk::PolygonMode::FILL);
        builder.set_polygon_mode(vk::PolygonMode::POINT);
        assert_eq!(builder.polygon_mode, vk::PolygonMode::FILL);
        assert_eq!(logger.count(Severity::Warning), 2);

        let records = logger.records();
        assert!(records[0].message.contains("Test Integrated GPU"));
        assert!(records[0].message.contains("LINE"));
        assert!(records[0].message.contains("FILL"));
    }

    #[test]
    fn supported_polygon_mode_is_kept() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_polygon_mode(vk::PolygonMode::LINE);
        assert_eq!(builder.polygon_mode, vk::PolygonMode::LINE);
        assert!(logger.records().is_empty());
    }

    #[test]
    fn depth_clamp_disabled_with_info() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_depth_clamp_enable(true);
        assert!(!builder.depth_clamp);
        assert_eq!(logger.count(Severity::Info), 1);
        assert_eq!(logger.count(Severity::Warning), 0);
    }

    #[test]
    fn sample_shading_disabled_when_unsupported() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_multisampling(true, vk::SampleCountFlags::TYPE_4, 0.5, &[], false, false);
        assert!(!builder.sample_shading);
        assert_eq!(builder.min_sample_shading, 0.0);
        assert_eq!(builder.rasterization_samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(logger.count(Severity::Warning), 1);
    }

    #[test]
    fn min_sample_shading_is_clamped() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_multisampling(true, vk::SampleCountFlags::TYPE_8, 1.5, &[], false, true);
        assert!(builder.sample_shading);
        assert_eq!(builder.min_sample_shading, 1.0);
        assert_eq!(builder.rasterization_samples, vk::SampleCountFlags::TYPE_8);
        assert!(builder.alpha_to_one);

        builder.set_multisampling(false, vk::SampleCountFlags::TYPE_1, 0.7, &[], false, false);
        assert_eq!(builder.min_sample_shading, 0.0);
        assert!(logger.records().is_empty());
    }

    #[test]
    fn rasterization_samples_follow_depth_stencil_usage() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();

        let mut color_only = GraphicsPipelineBuilder::new("test", &caps, &logger);
        color_only.set_multisampling(false, vk::SampleCountFlags::TYPE_8, 0.0, &[], false, false);
        assert_eq!(color_only.rasterization_samples, vk::SampleCountFlags::TYPE_4);

        let mut stencil = GraphicsPipelineBuilder::new("test", &caps, &logger);
        stencil
            .set_stencil_test_enable(true)
            .set_multisampling(false, vk::SampleCountFlags::TYPE_4, 0.0, &[], false, false);
        assert_eq!(stencil.rasterization_samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn other_optional_features_are_disabled_when_unsupported() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder
            .set_depth_bounds_test_enable(true)
            .set_color_blend_logical_op(true, vk::LogicOp::XOR)
            .set_tessellation_patch_control_points(3)
            .set_multisampling(false, vk::SampleCountFlags::TYPE_1, 0.0, &[], false, true);

        assert!(!builder.depth_bounds_test);
        assert!(!builder.logic_op_enable);
        assert_eq!(builder.logic_op, vk::LogicOp::XOR);
        assert_eq!(builder.patch_control_points, None);
        assert!(!builder.alpha_to_one);
        assert_eq!(logger.count(Severity::Warning), 4);
    }

    #[test]
    fn downgrades_log_to_the_rendering_pipe() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder.set_depth_clamp_enable(true).set_line_width(4.0);
        for record in logger.records() {
            assert_eq!(record.pipe, RENDERING_PIPE);
            assert_eq!(record.domain, Domain::Rendering);
        }
    }

    #[test]
    fn derivative_flags_and_base_handle() {
        let base = vk::Pipeline::from_raw(0xBA5E);
        let (flags, handle, index) = derivative_setup(false, Some(base));
        assert!(flags.contains(vk::PipelineCreateFlags::DERIVATIVE));
        assert_eq!(handle, base);
        assert_eq!(index, -1);

        let (flags, handle, _) = derivative_setup(false, None);
        assert!(!flags.contains(vk::PipelineCreateFlags::DERIVATIVE));
        assert_eq!(handle, vk::Pipeline::null());

        let (flags, _, _) = derivative_setup(true, None);
        assert_eq!(flags, vk::PipelineCreateFlags::ALLOW_DERIVATIVES);
    }

    #[test]
    fn add_stage_fails_for_missing_file() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        let missing = std::env::temp_dir().join("tritium-pipeline-missing.spv");
        assert!(builder
            .add_stage(&missing, "main", vk::ShaderStageFlags::VERTEX)
            .is_err());
        assert!(builder.stages.is_empty());
        assert!(builder.entry_points.is_empty());
    }

    #[test]
    fn entry_points_keep_their_address() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);
        let path = spirv_file("stage.spv");

        builder
            .add_stage(&path, "vertex_main", vk::ShaderStageFlags::VERTEX)
            .unwrap();
        let first = builder.entry_points[0].as_ptr();

        for _ in 0..32 {
            builder
                .add_stage(&path, "fragment_main", vk::ShaderStageFlags::FRAGMENT)
                .unwrap();
        }

        assert_eq!(builder.entry_points[0].as_ptr(), first);
        assert_eq!(builder.entry_points[0].to_str().unwrap(), "vertex_main");
        assert_eq!(builder.stages.len(), 33);
        assert_eq!(builder.stages[0].stage, vk::ShaderStageFlags::VERTEX);
        assert_eq!(builder.stages[32].entry_point, 32);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn alpha_blending_defaults() {
        let state = alpha_blend_attachment();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(state.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn dynamic_states_are_deduplicated() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = GraphicsPipelineBuilder::new("test", &caps, &logger);

        builder
            .add_dynamic_state(vk::DynamicState::VIEWPORT)
            .add_dynamic_state(vk::DynamicState::SCISSOR)
            .add_dynamic_state(vk::DynamicState::VIEWPORT);
        assert_eq!(builder.dynamic_states.len(), 2);
    }
}
