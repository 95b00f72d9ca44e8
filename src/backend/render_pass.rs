// Render Pass - attachments, subpasses and the dependencies between them
//
// Responsibilities:
// - Collect attachment descriptions, negotiating their sample counts
// - Collect subpasses; a subpass index is its insertion order and never changes
// - Resolve subpass dependencies to indices and create one immutable render pass
// - Remember which pipeline was built for which subpass

use anyhow::{Context, Result};
use ash::vk;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::capabilities::{format_has_depth, format_has_stencil, DeviceCapabilities};
use super::device::VirtualDevice;
use super::pipeline::GraphicsPipeline;
use crate::logging::{Logger, Severity};

static NEXT_BUILDER_ID: AtomicU64 = AtomicU64::new(0);

/// Handle to a subpass inserted into a `RenderPassBuilder`.
///
/// Only valid for the builder that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubpassId {
    builder: u64,
    index: u32,
}

impl SubpassId {
    /// Zero-based insertion index, which is also the Vulkan subpass index
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// One end of a subpass dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpassTarget {
    /// Commands outside the render pass
    External,
    /// The subpass declaring the dependency
    This,
    Subpass(SubpassId),
}

#[derive(Debug, Clone, Copy)]
struct DependencyDecl {
    src: SubpassTarget,
    dst: SubpassTarget,
    src_stage_mask: vk::PipelineStageFlags,
    dst_stage_mask: vk::PipelineStageFlags,
    src_access_mask: vk::AccessFlags,
    dst_access_mask: vk::AccessFlags,
    flags: vk::DependencyFlags,
}

/// Attachment references and dependencies for one subpass
#[derive(Debug, Clone)]
pub struct SubpassBuilder {
    bind_point: vk::PipelineBindPoint,
    input_attachments: Vec<vk::AttachmentReference>,
    color_attachments: Vec<vk::AttachmentReference>,
    resolve_attachments: Vec<vk::AttachmentReference>,
    depth_stencil_attachment: Option<vk::AttachmentReference>,
    preserve_attachments: Vec<u32>,
    dependencies: Vec<DependencyDecl>,
}

impl Default for SubpassBuilder {
    fn default() -> Self {
        Self {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            input_attachments: Vec::new(),
            color_attachments: Vec::new(),
            resolve_attachments: Vec::new(),
            depth_stencil_attachment: None,
            preserve_attachments: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}

fn attachment_ref(attachment: u32, layout: vk::ImageLayout) -> vk::AttachmentReference {
    vk::AttachmentReference { attachment, layout }
}

impl SubpassBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bind_point(&mut self, bind_point: vk::PipelineBindPoint) -> &mut Self {
        self.bind_point = bind_point;
        self
    }

    pub fn add_input_attachment_ref(&mut self, attachment: u32, layout: vk::ImageLayout) -> &mut Self {
        self.input_attachments.push(attachment_ref(attachment, layout));
        self
    }

    pub fn add_color_attachment_ref(&mut self, attachment: u32, layout: vk::ImageLayout) -> &mut Self {
        self.color_attachments.push(attachment_ref(attachment, layout));
        self
    }

    /// Resolve targets pair up with color attachments by position
    pub fn add_resolve_attachment_ref(&mut self, attachment: u32, layout: vk::ImageLayout) -> &mut Self {
        self.resolve_attachments.push(attachment_ref(attachment, layout));
        self
    }

    /// A subpass has at most one depth/stencil attachment; the last call wins
    pub fn set_depth_stencil_attachment_ref(&mut self, attachment: u32, layout: vk::ImageLayout) -> &mut Self {
        self.depth_stencil_attachment = Some(attachment_ref(attachment, layout));
        self
    }

    pub fn add_preserve_attachment(&mut self, attachment: u32) -> &mut Self {
        self.preserve_attachments.push(attachment);
        self
    }

    /// Declare an execution/memory dependency. Targets are resolved to
    /// subpass indices when the render pass is built.
    #[allow(clippy::too_many_arguments)]
    pub fn add_dependency(
        &mut self,
        src: SubpassTarget,
        dst: SubpassTarget,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        src_access_mask: vk::AccessFlags,
        dst_access_mask: vk::AccessFlags,
        flags: vk::DependencyFlags,
    ) -> &mut Self {
        self.dependencies.push(DependencyDecl {
            src,
            dst,
            src_stage_mask,
            dst_stage_mask,
            src_access_mask,
            dst_access_mask,
            flags,
        });
        self
    }
}

/// Owned storage for one subpass description
#[derive(Debug, Clone)]
struct SubpassLayout {
    bind_point: vk::PipelineBindPoint,
    input_attachments: Vec<vk::AttachmentReference>,
    color_attachments: Vec<vk::AttachmentReference>,
    resolve_attachments: Vec<vk::AttachmentReference>,
    depth_stencil_attachment: Option<vk::AttachmentReference>,
    preserve_attachments: Vec<u32>,
}

/// Everything `vkCreateRenderPass` needs, validated and with dependencies
/// resolved to indices
#[derive(Debug, Clone)]
struct RenderPassLayout {
    attachments: Vec<vk::AttachmentDescription>,
    subpasses: Vec<SubpassLayout>,
    dependencies: Vec<vk::SubpassDependency>,
}

pub struct RenderPassBuilder<'a> {
    name: String,
    id: u64,
    caps: &'a DeviceCapabilities,
    logger: &'a dyn Logger,
    attachments: Vec<vk::AttachmentDescription>,
    subpasses: Vec<SubpassBuilder>,
}

impl<'a> RenderPassBuilder<'a> {
    /// Usually obtained through `VirtualDevice::render_pass_builder`
    pub fn new(name: &str, caps: &'a DeviceCapabilities, logger: &'a dyn Logger) -> Self {
        Self {
            name: name.to_string(),
            id: NEXT_BUILDER_ID.fetch_add(1, Ordering::Relaxed),
            caps,
            logger,
            attachments: Vec::new(),
            subpasses: Vec::new(),
        }
    }

    /// Append an attachment. The sample count is replaced by the highest
    /// count the device supports for this format, never above `samples`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_attachment_description(
        &mut self,
        flags: vk::AttachmentDescriptionFlags,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        stencil_load_op: vk::AttachmentLoadOp,
        stencil_store_op: vk::AttachmentStoreOp,
        initial_layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
    ) -> &mut Self {
        let used_samples = self.caps.multisampling_samples_fallback(
            samples,
            format_has_depth(format),
            format_has_stencil(format),
        );

        if used_samples != samples {
            self.logger.rendering(
                Severity::Info,
                &format!(
                    "The enabled GPU \"{}\" does not support {} samples for attachment {} of render pass \"{}\". Falling back to {} samples.",
                    self.caps.device_name,
                    samples.as_raw(),
                    self.attachments.len(),
                    self.name,
                    used_samples.as_raw()
                ),
            );
        }

        self.attachments.push(vk::AttachmentDescription {
            flags,
            format,
            samples: used_samples,
            load_op,
            store_op,
            stencil_load_op,
            stencil_store_op,
            initial_layout,
            final_layout,
        });
        self
    }

    /// Insert a subpass. Its index is the number of subpasses inserted before it.
    pub fn add_subpass(&mut self, subpass: SubpassBuilder) -> SubpassId {
        let id = SubpassId {
            builder: self.id,
            index: self.subpasses.len() as u32,
        };
        self.subpasses.push(subpass);
        id
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn subpass_count(&self) -> usize {
        self.subpasses.len()
    }

    /// Create the render pass. Failures are logged FATAL and returned.
    pub fn build(self, device: &Arc<VirtualDevice>) -> Result<Rc<RenderPass>> {
        debug_assert!(
            std::ptr::eq(self.caps, device.capabilities()),
            "render pass builder used with a different device"
        );

        let layout = match self.assemble() {
            Ok(layout) => layout,
            Err(e) => {
                self.logger.rendering(
                    Severity::Fatal,
                    &format!("Render pass \"{}\" is invalid: {:#}", self.name, e),
                );
                return Err(e);
            }
        };

        let subpasses: Vec<vk::SubpassDescription> = layout
            .subpasses
            .iter()
            .map(|subpass| {
                let mut description = vk::SubpassDescription::builder()
                    .pipeline_bind_point(subpass.bind_point)
                    .input_attachments(&subpass.input_attachments)
                    .color_attachments(&subpass.color_attachments)
                    .preserve_attachments(&subpass.preserve_attachments);
                if !subpass.resolve_attachments.is_empty() {
                    description = description.resolve_attachments(&subpass.resolve_attachments);
                }
                if let Some(depth_stencil) = subpass.depth_stencil_attachment.as_ref() {
                    description = description.depth_stencil_attachment(depth_stencil);
                }
                description.build()
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&layout.attachments)
            .subpasses(&subpasses)
            .dependencies(&layout.dependencies);

        let handle = match unsafe { device.device.create_render_pass(&create_info, None) } {
            Ok(handle) => handle,
            Err(e) => {
                self.logger.rendering(
                    Severity::Fatal,
                    &format!(
                        "Failed to create render pass \"{}\" on GPU \"{}\": {:?}",
                        self.name, self.caps.device_name, e
                    ),
                );
                return Err(e).context("Failed to create render pass");
            }
        };

        log::info!(
            "Created render pass \"{}\" ({} attachments, {} subpasses)",
            self.name,
            layout.attachments.len(),
            layout.subpasses.len()
        );

        Ok(Rc::new(RenderPass {
            handle,
            name: self.name,
            subpass_count: layout.subpasses.len() as u32,
            pipelines: RefCell::new(BTreeMap::new()),
            device: device.clone(),
        }))
    }

    fn resolve_target(&self, target: SubpassTarget, declaring: u32) -> Result<u32> {
        match target {
            SubpassTarget::External => Ok(vk::SUBPASS_EXTERNAL),
            SubpassTarget::This => Ok(declaring),
            SubpassTarget::Subpass(id) => {
                if id.builder != self.id || id.index as usize >= self.subpasses.len() {
                    anyhow::bail!(
                        "subpass {} declares a dependency on a subpass that does not belong to this render pass",
                        declaring
                    );
                }
                Ok(id.index)
            }
        }
    }

    fn check_reference(&self, subpass: usize, reference: &vk::AttachmentReference) -> Result<()> {
        if reference.attachment != vk::ATTACHMENT_UNUSED
            && reference.attachment as usize >= self.attachments.len()
        {
            anyhow::bail!(
                "subpass {} references attachment {} but only {} are described",
                subpass,
                reference.attachment,
                self.attachments.len()
            );
        }
        Ok(())
    }

    fn assemble(&self) -> Result<RenderPassLayout> {
        if self.subpasses.is_empty() {
            anyhow::bail!("a render pass needs at least one subpass");
        }

        let mut subpasses = Vec::with_capacity(self.subpasses.len());
        let mut dependencies = Vec::new();

        for (index, subpass) in self.subpasses.iter().enumerate() {
            if !subpass.resolve_attachments.is_empty()
                && subpass.resolve_attachments.len() != subpass.color_attachments.len()
            {
                anyhow::bail!(
                    "subpass {} has {} resolve attachments for {} color attachments",
                    index,
                    subpass.resolve_attachments.len(),
                    subpass.color_attachments.len()
                );
            }

            for reference in subpass
                .input_attachments
                .iter()
                .chain(&subpass.color_attachments)
                .chain(&subpass.resolve_attachments)
                .chain(subpass.depth_stencil_attachment.iter())
            {
                self.check_reference(index, reference)?;
            }

            if let Some(&preserved) = subpass
                .preserve_attachments
                .iter()
                .find(|&&attachment| attachment as usize >= self.attachments.len())
            {
                anyhow::bail!("subpass {} preserves unknown attachment {}", index, preserved);
            }

            for dependency in &subpass.dependencies {
                dependencies.push(vk::SubpassDependency {
                    src_subpass: self.resolve_target(dependency.src, index as u32)?,
                    dst_subpass: self.resolve_target(dependency.dst, index as u32)?,
                    src_stage_mask: dependency.src_stage_mask,
                    dst_stage_mask: dependency.dst_stage_mask,
                    src_access_mask: dependency.src_access_mask,
                    dst_access_mask: dependency.dst_access_mask,
                    dependency_flags: dependency.flags,
                });
            }

            subpasses.push(SubpassLayout {
                bind_point: subpass.bind_point,
                input_attachments: subpass.input_attachments.clone(),
                color_attachments: subpass.color_attachments.clone(),
                resolve_attachments: subpass.resolve_attachments.clone(),
                depth_stencil_attachment: subpass.depth_stencil_attachment,
                preserve_attachments: subpass.preserve_attachments.clone(),
            });
        }

        Ok(RenderPassLayout {
            attachments: self.attachments.clone(),
            subpasses,
            dependencies,
        })
    }
}

/// An immutable render pass plus the pipelines built against its subpasses
pub struct RenderPass {
    handle: vk::RenderPass,
    name: String,
    subpass_count: u32,
    pipelines: RefCell<BTreeMap<u32, Rc<GraphicsPipeline>>>,
    device: Arc<VirtualDevice>,
}

impl RenderPass {
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subpass_count(&self) -> u32 {
        self.subpass_count
    }

    pub fn device(&self) -> &Arc<VirtualDevice> {
        &self.device
    }

    /// Pipeline most recently built for `subpass`
    pub fn pipeline(&self, subpass: u32) -> Option<Rc<GraphicsPipeline>> {
        self.pipelines.borrow().get(&subpass).cloned()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.borrow().len()
    }

    /// Associate a pipeline with a subpass, returning the one it replaces
    pub fn register_pipeline(
        &self,
        subpass: u32,
        pipeline: Rc<GraphicsPipeline>,
    ) -> Option<Rc<GraphicsPipeline>> {
        self.pipelines.borrow_mut().insert(subpass, pipeline)
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        log::info!("Destroying render pass \"{}\"...", self.name);

        // Pipelines go first; they were built against this handle
        self.pipelines.borrow_mut().clear();

        unsafe {
            self.device.device.destroy_render_pass(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{capable_gpu, minimal_gpu, RecordingLogger};

    fn add_color(builder: &mut RenderPassBuilder<'_>, samples: vk::SampleCountFlags) {
        builder.add_attachment_description(
            vk::AttachmentDescriptionFlags::empty(),
            vk::Format::B8G8R8A8_SRGB,
            samples,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::AttachmentLoadOp::DONT_CARE,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
    }

    fn color_subpass() -> SubpassBuilder {
        let mut subpass = SubpassBuilder::new();
        subpass.add_color_attachment_ref(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        subpass
    }

    #[test]
    fn subpass_index_is_insertion_order() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = RenderPassBuilder::new("test", &caps, &logger);

        let ids: Vec<_> = (0..4).map(|_| builder.add_subpass(SubpassBuilder::new())).collect();
        let indices: Vec<_> = ids.iter().map(|id| id.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(builder.subpass_count(), 4);
    }

    #[test]
    fn attachment_samples_use_device_fallback() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();
        let mut builder = RenderPassBuilder::new("msaa", &caps, &logger);

        add_color(&mut builder, vk::SampleCountFlags::TYPE_8);
        add_color(&mut builder, vk::SampleCountFlags::TYPE_8);
        builder.add_subpass(color_subpass());

        let layout = builder.assemble().unwrap();
        assert_eq!(layout.attachments.len(), 2);
        for attachment in &layout.attachments {
            assert_eq!(attachment.samples, vk::SampleCountFlags::TYPE_4);
        }
        assert_eq!(logger.count(Severity::Info), 2);
    }

    #[test]
    fn stencil_formats_limit_samples() {
        let caps = minimal_gpu();
        let logger = RecordingLogger::default();
        let mut builder = RenderPassBuilder::new("depth", &caps, &logger);

        builder.add_attachment_description(
            vk::AttachmentDescriptionFlags::empty(),
            vk::Format::D24_UNORM_S8_UINT,
            vk::SampleCountFlags::TYPE_4,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );
        builder.add_subpass(SubpassBuilder::new());

        let layout = builder.assemble().unwrap();
        assert_eq!(layout.attachments[0].samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn supported_samples_are_kept_silently() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = RenderPassBuilder::new("msaa", &caps, &logger);

        add_color(&mut builder, vk::SampleCountFlags::TYPE_8);
        builder.add_subpass(color_subpass());

        let layout = builder.assemble().unwrap();
        assert_eq!(layout.attachments[0].samples, vk::SampleCountFlags::TYPE_8);
        assert!(logger.records().is_empty());
    }

    #[test]
    fn dependencies_resolve_to_indices() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = RenderPassBuilder::new("deferred", &caps, &logger);
        add_color(&mut builder, vk::SampleCountFlags::TYPE_1);

        let mut first = color_subpass();
        first.add_dependency(
            SubpassTarget::External,
            SubpassTarget::This,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::DependencyFlags::empty(),
        );
        let first_id = builder.add_subpass(first);

        let mut second = SubpassBuilder::new();
        second
            .add_input_attachment_ref(0, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .add_dependency(
                SubpassTarget::Subpass(first_id),
                SubpassTarget::This,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::INPUT_ATTACHMENT_READ,
                vk::DependencyFlags::BY_REGION,
            );
        builder.add_subpass(second);

        let layout = builder.assemble().unwrap();
        assert_eq!(layout.dependencies.len(), 2);
        assert_eq!(layout.dependencies[0].src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(layout.dependencies[0].dst_subpass, 0);
        assert_eq!(layout.dependencies[1].src_subpass, 0);
        assert_eq!(layout.dependencies[1].dst_subpass, 1);
        assert_eq!(layout.dependencies[1].dependency_flags, vk::DependencyFlags::BY_REGION);
    }

    #[test]
    fn foreign_subpass_ids_are_rejected() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();

        let mut other = RenderPassBuilder::new("other", &caps, &logger);
        let foreign = other.add_subpass(SubpassBuilder::new());

        let mut builder = RenderPassBuilder::new("main", &caps, &logger);
        let mut subpass = SubpassBuilder::new();
        subpass.add_dependency(
            SubpassTarget::Subpass(foreign),
            SubpassTarget::This,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::AccessFlags::empty(),
            vk::DependencyFlags::empty(),
        );
        builder.add_subpass(subpass);

        assert!(builder.assemble().is_err());
    }

    #[test]
    fn resolve_count_must_match_color_count() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = RenderPassBuilder::new("resolve", &caps, &logger);
        add_color(&mut builder, vk::SampleCountFlags::TYPE_4);
        add_color(&mut builder, vk::SampleCountFlags::TYPE_1);

        let mut subpass = color_subpass();
        subpass
            .add_resolve_attachment_ref(1, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .add_resolve_attachment_ref(1, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        builder.add_subpass(subpass);

        let err = builder.assemble().unwrap_err();
        assert!(err.to_string().contains("resolve"));
    }

    #[test]
    fn references_must_point_at_described_attachments() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let mut builder = RenderPassBuilder::new("broken", &caps, &logger);
        add_color(&mut builder, vk::SampleCountFlags::TYPE_1);

        let mut subpass = color_subpass();
        subpass.set_depth_stencil_attachment_ref(3, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        builder.add_subpass(subpass);
        assert!(builder.assemble().is_err());

        let mut unused = RenderPassBuilder::new("unused", &caps, &logger);
        add_color(&mut unused, vk::SampleCountFlags::TYPE_1);
        let mut subpass = color_subpass();
        subpass.add_color_attachment_ref(vk::ATTACHMENT_UNUSED, vk::ImageLayout::UNDEFINED);
        unused.add_subpass(subpass);
        assert!(unused.assemble().is_ok());
    }

    #[test]
    fn empty_render_pass_is_invalid() {
        let caps = capable_gpu();
        let logger = RecordingLogger::default();
        let builder = RenderPassBuilder::new("empty", &caps, &logger);
        assert!(builder.assemble().is_err());
    }

    #[test]
    fn subpass_defaults_to_graphics_bind_point() {
        let subpass = SubpassBuilder::new();
        assert_eq!(subpass.bind_point, vk::PipelineBindPoint::GRAPHICS);
        assert!(subpass.depth_stencil_attachment.is_none());
    }
}
