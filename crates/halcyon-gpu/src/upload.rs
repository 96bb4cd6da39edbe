//! Texture upload.
//!
//! With host image copy the texels are written straight into the image from
//! the CPU. Otherwise they go through a staging buffer and a copy on the
//! graphics queue, which also builds the mip chain when asked to.

use crate::command::CommandList;
use crate::context::Context;
use crate::driver::{BufferDesc, ImageBarrier, ImageDesc};
use crate::error::{GpuError, Result};
use crate::fence::SyncPoint;
use crate::queue::{QueueKind, SubmitInfo};
use crate::resource::Image;
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Tightly packed texels of mip 0.
#[derive(Debug, Clone, Copy)]
pub struct ImageData<'a> {
    pub bytes: &'a [u8],
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl ImageData<'_> {
    /// Byte size the extent and format call for.
    pub fn expected_len(&self) -> Result<usize> {
        let texel = bytes_per_texel(self.format).ok_or_else(|| {
            GpuError::InvalidState(format!("cannot upload {:?} texels", self.format))
        })?;
        Ok(self.extent.width as usize * self.extent.height as usize * texel as usize)
    }
}

/// Size of one texel for the uncompressed color formats uploads accept.
pub fn bytes_per_texel(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R16G16_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// A sampled image whose contents may still be in flight.
#[derive(Debug)]
pub struct UploadedImage {
    pub image: Image,
    /// Completion of the staged copy; `None` when the data was written from the host.
    pub ready: Option<SyncPoint>,
}

fn mip_extent(extent: vk::Extent2D, mip: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width >> mip).max(1),
        height: (extent.height >> mip).max(1),
    }
}

/// Create a sampled image from `data`, optionally with a full mip chain.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub fn upload_image(
    context: &Context,
    name: &str,
    data: &ImageData<'_>,
    mips: bool,
) -> Result<UploadedImage> {
    let expected = data.expected_len()?;
    if data.bytes.len() != expected {
        return Err(GpuError::InvalidState(format!(
            "'{name}' has {} bytes but {}x{} {:?} needs {expected}",
            data.bytes.len(),
            data.extent.width,
            data.extent.height,
            data.format
        )));
    }

    let mip_levels = if mips {
        ImageDesc::full_mip_chain(data.extent)
    } else {
        1
    };

    // Blitting mips needs a command list either way.
    if context.caps().host_image_copy && mip_levels == 1 {
        let image = context.create_image(&ImageDesc {
            name,
            format: data.format,
            extent: data.extent,
            mip_levels,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::HOST_TRANSFER_EXT,
        })?;
        context
            .driver()
            .copy_memory_to_image(image.acquire()?.allocation(), data.bytes)?;
        tracing::trace!("Uploaded '{name}' from the host");
        return Ok(UploadedImage { image, ready: None });
    }

    let staging = context.create_buffer(&BufferDesc {
        name: "upload staging",
        size: expected as u64,
        usage: vk::BufferUsageFlags::TRANSFER_SRC,
        location: MemoryLocation::CpuToGpu,
    })?;
    staging.acquire()?.write_bytes(0, data.bytes)?;

    let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
    if mip_levels > 1 {
        usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    let image = context.create_image(&ImageDesc {
        name,
        format: data.format,
        extent: data.extent,
        mip_levels,
        usage,
    })?;

    let target = image.acquire()?.raw();
    let queue = context.queue(QueueKind::Graphics, 0)?;
    let mut list = queue.begin()?;
    list.image_barrier(&ImageBarrier {
        image: target,
        aspect: vk::ImageAspectFlags::COLOR,
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        src_stage: vk::PipelineStageFlags2::NONE,
        src_access: vk::AccessFlags2::NONE,
        dst_stage: vk::PipelineStageFlags2::TRANSFER,
        dst_access: vk::AccessFlags2::TRANSFER_WRITE,
        base_mip: 0,
        mip_count: mip_levels,
    })?;
    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: data.extent.width,
            height: data.extent.height,
            depth: 1,
        },
    };
    list.copy_buffer_to_image(staging.acquire()?.raw(), target, &[region])?;
    generate_mips(&mut list, &image)?;

    let ready = queue.submit(vec![list], SubmitInfo::default())?;
    // The staging buffer is retired against the submission that reads it.
    drop(staging);
    tracing::trace!("Staged upload of '{name}' ({mip_levels} mips)");
    Ok(UploadedImage {
        image,
        ready: Some(ready),
    })
}

/// Fill mips 1.. of `image` by successive linear blits from mip 0.
///
/// Every mip must be in `TRANSFER_DST_OPTIMAL`; all of them end in
/// `SHADER_READ_ONLY_OPTIMAL`. Fails if `image` was retired.
pub fn generate_mips(list: &mut CommandList, image: &Image) -> Result<()> {
    let image = image.acquire()?;
    let levels = image.mip_levels();
    let needed = if levels > 1 {
        vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST
    } else {
        vk::ImageUsageFlags::TRANSFER_DST
    };
    if !image.usage().contains(needed) {
        return Err(GpuError::InvalidState(format!(
            "mip generation needs {needed:?} usage"
        )));
    }

    let barrier = |mip, old_layout, new_layout, dst_stage, dst_access| ImageBarrier {
        image: image.raw(),
        aspect: vk::ImageAspectFlags::COLOR,
        old_layout,
        new_layout,
        src_stage: vk::PipelineStageFlags2::TRANSFER,
        src_access: vk::AccessFlags2::TRANSFER_WRITE,
        dst_stage,
        dst_access,
        base_mip: mip,
        mip_count: 1,
    };
    let shader_read = (
        vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
    );

    let extent = image.extent();
    for mip in 0..levels - 1 {
        list.image_barrier(&barrier(
            mip,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ))?;
        list.blit_mip(
            image.raw(),
            mip,
            mip_extent(extent, mip),
            mip_extent(extent, mip + 1),
        )?;
        let mut done = barrier(
            mip,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            shader_read.0,
            shader_read.1,
        );
        done.src_access = vk::AccessFlags2::TRANSFER_READ;
        list.image_barrier(&done)?;
    }

    list.image_barrier(&barrier(
        levels - 1,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        shader_read.0,
        shader_read.1,
    ))
}
