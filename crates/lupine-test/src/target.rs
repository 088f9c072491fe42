//! Scriptable presentation target.

use crate::device::FakeDevice;
use ash::vk::{self, Handle};
use lupine_gpu::{AcquiredImage, GpuError, PresentationTarget, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Presentation target whose images are plain fake handles.
///
/// Images are handed out round-robin unless an order is scripted. Acquire and
/// present are logged into the owning [`FakeDevice`], which tracks their
/// semaphores. Acquiring an image that was never presented back is reported
/// as a violation, since a real swapchain would run dry.
pub struct FakeTarget {
    device: Arc<FakeDevice>,
    views: Vec<vk::ImageView>,
    extent: vk::Extent2D,
    format: vk::Format,
    depth: Option<(vk::ImageView, vk::Format)>,
    multisample: Option<vk::ImageView>,
    next: u32,
    scripted: VecDeque<u32>,
    acquire_failures: VecDeque<GpuError>,
    acquire_suboptimal: bool,
    present_failures: VecDeque<GpuError>,
    present_suboptimal: bool,
    presented: Vec<u32>,
    held: HashSet<u32>,
}

impl FakeTarget {
    /// Target with `image_count` images of `width`x`height`.
    pub fn new(device: &Arc<FakeDevice>, width: u32, height: u32, image_count: usize) -> Self {
        Self {
            device: Arc::clone(device),
            views: fabricate_views(device, image_count),
            extent: vk::Extent2D { width, height },
            format: vk::Format::B8G8R8A8_SRGB,
            depth: None,
            multisample: None,
            next: 0,
            scripted: VecDeque::new(),
            acquire_failures: VecDeque::new(),
            acquire_suboptimal: false,
            present_failures: VecDeque::new(),
            present_suboptimal: false,
            presented: Vec::new(),
            held: HashSet::new(),
        }
    }

    /// Add a shared depth attachment.
    pub fn with_depth(mut self, format: vk::Format) -> Self {
        let view = vk::ImageView::from_raw(self.device.fabricate_handle());
        self.depth = Some((view, format));
        self
    }

    /// Add a multisampled color attachment.
    pub fn with_multisample(mut self) -> Self {
        self.multisample = Some(vk::ImageView::from_raw(self.device.fabricate_handle()));
        self
    }

    /// Hand out these image indices next, in order.
    pub fn script_acquire_order(&mut self, indices: &[u32]) {
        self.scripted.extend(indices);
    }

    /// Fail the next acquisition with `error`.
    pub fn fail_next_acquire(&mut self, error: GpuError) {
        self.acquire_failures.push_back(error);
    }

    /// Report the next acquired image as suboptimal.
    pub fn next_acquire_suboptimal(&mut self) {
        self.acquire_suboptimal = true;
    }

    /// Fail the next presentation with `error`.
    pub fn fail_next_present(&mut self, error: GpuError) {
        self.present_failures.push_back(error);
    }

    /// Report the next presentation as suboptimal.
    pub fn present_suboptimal_next(&mut self) {
        self.present_suboptimal = true;
    }

    /// Simulate a rebuilt swapchain: new views, new extent.
    pub fn resize(&mut self, width: u32, height: u32, image_count: usize) {
        self.views = fabricate_views(&self.device, image_count);
        self.extent = vk::Extent2D { width, height };
        self.next = 0;
        self.scripted.clear();
        self.held.clear();
        if let Some((_, format)) = self.depth {
            let view = vk::ImageView::from_raw(self.device.fabricate_handle());
            self.depth = Some((view, format));
        }
    }

    /// Images acquired and not yet presented.
    pub fn held_images(&self) -> usize {
        self.held.len()
    }

    /// Image indices presented so far.
    pub fn presented(&self) -> &[u32] {
        &self.presented
    }
}

impl PresentationTarget for FakeTarget {
    fn image_views(&self) -> &[vk::ImageView] {
        &self.views
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn color_format(&self) -> vk::Format {
        self.format
    }

    fn depth_view(&self) -> Option<vk::ImageView> {
        self.depth.map(|(view, _)| view)
    }

    fn depth_format(&self) -> Option<vk::Format> {
        self.depth.map(|(_, format)| format)
    }

    fn multisample_view(&self) -> Option<vk::ImageView> {
        self.multisample
    }

    unsafe fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        if let Some(error) = self.acquire_failures.pop_front() {
            return Err(error);
        }

        let count = self.views.len() as u32;
        let index = self.scripted.pop_front().unwrap_or_else(|| {
            let index = self.next;
            self.next = (self.next + 1) % count.max(1);
            index
        });

        if !self.held.insert(index) {
            self.device
                .report_violation(format!("Image {index} acquired again before it was presented"));
        }
        self.device.acquire_image(index, semaphore);
        Ok(AcquiredImage {
            index,
            suboptimal: std::mem::take(&mut self.acquire_suboptimal),
        })
    }

    unsafe fn present(
        &mut self,
        _queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool> {
        if let Some(error) = self.present_failures.pop_front() {
            return Err(error);
        }

        if !self.held.remove(&image_index) {
            self.device
                .report_violation(format!("Presenting image {image_index} that is not acquired"));
        }
        self.device.present_image(image_index, wait_semaphore);
        self.presented.push(image_index);
        Ok(std::mem::take(&mut self.present_suboptimal))
    }
}

fn fabricate_views(device: &FakeDevice, count: usize) -> Vec<vk::ImageView> {
    (0..count)
        .map(|_| vk::ImageView::from_raw(device.fabricate_handle()))
        .collect()
}
