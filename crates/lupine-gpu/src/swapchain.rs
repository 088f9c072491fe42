//! Presentation targets and swapchain management.

use crate::context::GpuContext;
use crate::device::DeviceContext;
use crate::error::{GpuError, Result};
use crate::memory::GpuImage;
use ash::vk;
use std::sync::Arc;

/// Image handed out by [`PresentationTarget::acquire_next_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The image can still be presented but the target no longer matches the surface exactly.
    pub suboptimal: bool,
}

/// The window/swapchain boundary consumed by the frame orchestrator.
///
/// Implementations own the presentation images and their views; the core
/// only borrows views to build framebuffers.
pub trait PresentationTarget {
    /// One view per presentation image, in image-index order.
    fn image_views(&self) -> &[vk::ImageView];

    /// Current image dimensions.
    fn extent(&self) -> vk::Extent2D;

    /// Format of the presentation images.
    fn color_format(&self) -> vk::Format;

    /// Depth attachment shared by every framebuffer, if the target has one.
    fn depth_view(&self) -> Option<vk::ImageView> {
        None
    }

    /// Format of [`depth_view`](Self::depth_view).
    fn depth_format(&self) -> Option<vk::Format> {
        None
    }

    /// Multisampled color attachment resolved into the presentation image.
    fn multisample_view(&self) -> Option<vk::ImageView> {
        None
    }

    /// Number of presentation images.
    fn image_count(&self) -> usize {
        self.image_views().len()
    }

    /// Acquire the next image; `semaphore` is signaled once it is available.
    ///
    /// An out-of-date target returns [`GpuError::SwapchainOutOfDate`] and
    /// acquires nothing.
    ///
    /// # Safety
    /// `semaphore` must be unsignaled with no pending signal operation.
    unsafe fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquiredImage>;

    /// Queue image `image_index` for presentation after `wait_semaphore`.
    ///
    /// Returns `true` when the target is suboptimal or out of date and should
    /// be rebuilt.
    ///
    /// # Safety
    /// `image_index` must have been acquired and `wait_semaphore` must have a
    /// pending signal operation.
    unsafe fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool>;
}

/// Depth image backing every framebuffer of a swapchain.
struct DepthAttachment {
    image: GpuImage,
    view: vk::ImageView,
}

/// Swapchain on a platform surface, with an optional depth attachment.
pub struct Swapchain {
    device: Arc<ash::Device>,
    loader: ash::khr::swapchain::Device,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    vsync: bool,
    depth_format: Option<vk::Format>,
    depth: Option<DepthAttachment>,
}

impl Swapchain {
    /// Create a swapchain on `surface`.
    ///
    /// The surface is owned by the caller and must outlive the swapchain.
    /// `depth_format` adds a depth attachment allocated through the context's
    /// attachment allocator.
    ///
    /// # Safety
    /// `surface` must be a valid surface created from the context's instance.
    pub unsafe fn new(
        context: &GpuContext,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        vsync: bool,
        depth_format: Option<vk::Format>,
    ) -> Result<Self> {
        let surface_loader = ash::khr::surface::Instance::new(context.entry(), context.instance());
        let loader = ash::khr::swapchain::Device::new(context.instance(), context.device());

        let supported = surface_loader.get_physical_device_surface_support(
            context.physical_device(),
            context.graphics_queue_family(),
            surface,
        )?;
        if !supported {
            return Err(GpuError::InvalidArgument(
                "Graphics queue cannot present to this surface".to_string(),
            ));
        }

        let mut swapchain = Self {
            device: Arc::clone(context.device()),
            loader,
            surface_loader,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            vsync,
            depth_format,
            depth: None,
        };
        if let Err(e) = swapchain.build(context, width, height) {
            swapchain.destroy(context);
            return Err(e);
        }

        Ok(swapchain)
    }

    /// Rebuild the swapchain for new surface dimensions.
    ///
    /// # Safety
    /// No submitted work may still reference the old images.
    pub unsafe fn recreate(&mut self, context: &GpuContext, width: u32, height: u32) -> Result<()> {
        self.destroy_attachments(context);
        self.build(context, width, height)
    }

    unsafe fn build(&mut self, context: &GpuContext, width: u32, height: u32) -> Result<()> {
        let physical_device = context.physical_device();
        let capabilities = self
            .surface_loader
            .get_physical_device_surface_capabilities(physical_device, self.surface)?;
        let formats = self
            .surface_loader
            .get_physical_device_surface_formats(physical_device, self.surface)?;
        let present_modes = self
            .surface_loader
            .get_physical_device_surface_present_modes(physical_device, self.surface)?;

        let surface_format = select_surface_format(&formats).ok_or_else(|| {
            GpuError::InvalidArgument("Surface reports no formats".to_string())
        })?;
        let present_mode = select_present_mode(&present_modes, self.vsync);
        let extent = calculate_extent(&capabilities, width, height);

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
            image_count = capabilities.max_image_count;
        }

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = self
            .loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::creation("swapchain", e))?;
        if old_swapchain != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(old_swapchain, None);
        }
        self.swapchain = swapchain;
        self.format = surface_format.format;
        self.extent = extent;

        self.images = self.loader.get_swapchain_images(swapchain)?;
        for &image in &self.images {
            let view = create_view(
                &self.device,
                image,
                surface_format.format,
                vk::ImageAspectFlags::COLOR,
            )?;
            self.image_views.push(view);
        }

        if let Some(format) = self.depth_format {
            self.depth = Some(create_depth_attachment(context, format, extent)?);
        }

        tracing::info!(
            "Swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            self.images.len(),
            surface_format.format,
            present_mode
        );

        Ok(())
    }

    unsafe fn destroy_attachments(&mut self, context: &GpuContext) {
        for view in self.image_views.drain(..) {
            self.device.destroy_image_view(view, None);
        }
        self.images.clear();

        if let Some(mut depth) = self.depth.take() {
            self.device.destroy_image_view(depth.view, None);
            if let Err(e) = context.allocator().lock().free_image(&mut depth.image) {
                tracing::warn!("Freeing depth attachment failed: {e}");
            }
        }
    }

    /// Destroy the swapchain, its views and the depth attachment.
    ///
    /// # Safety
    /// No submitted work may still reference the swapchain images.
    pub unsafe fn destroy(&mut self, context: &GpuContext) {
        self.destroy_attachments(context);
        if self.swapchain != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    /// Raw swapchain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Presentation images.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }
}

impl PresentationTarget for Swapchain {
    fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn color_format(&self) -> vk::Format {
        self.format
    }

    fn depth_view(&self) -> Option<vk::ImageView> {
        self.depth.as_ref().map(|depth| depth.view)
    }

    fn depth_format(&self) -> Option<vk::Format> {
        self.depth.as_ref().map(|depth| depth.image.format)
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    unsafe fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        self.loader
            .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
            .map(|(index, suboptimal)| AcquiredImage { index, suboptimal })
            .map_err(GpuError::from)
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    unsafe fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match self.loader.queue_present(queue, &present_info) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }
}

unsafe fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    device
        .create_image_view(&view_info, None)
        .map_err(|e| GpuError::creation("image view", e))
}

unsafe fn create_depth_attachment(
    context: &GpuContext,
    format: vk::Format,
    extent: vk::Extent2D,
) -> Result<DepthAttachment> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let mut image = context
        .allocator()
        .lock()
        .create_image(&image_info, "swapchain depth")?;

    match create_view(context.device(), image.image, format, vk::ImageAspectFlags::DEPTH) {
        Ok(view) => Ok(DepthAttachment { image, view }),
        Err(e) => {
            let _ = context.allocator().lock().free_image(&mut image);
            Err(e)
        }
    }
}

/// Select the surface format, preferring 8-bit BGRA sRGB.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// Select the present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn srgb_format_is_preferred() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            select_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert_eq!(
            select_surface_format(&formats[..1]).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert!(select_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_fallbacks() {
        let all = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&all[..1], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_follows_surface_or_clamps() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        assert_eq!(calculate_extent(&capabilities, 800, 600).width, 1280);

        capabilities.current_extent.width = u32::MAX;
        let extent = calculate_extent(&capabilities, 8000, 0);
        assert_eq!((extent.width, extent.height), (4096, 1));
    }
}
