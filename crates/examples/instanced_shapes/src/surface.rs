use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use rt_core::gpu::{
    BufferDesc, BufferPurpose, CommandList, GpuBuffer, HeapKind, PresentationSurface, RenderDevice, ResourceState,
    TextureFormat, TextureId,
};

/// Headless surface: every frame is copied into a readback buffer and the latest one is
/// kept on the CPU until [`save`](Self::save).
pub struct ReadbackSurface<D: RenderDevice> {
    width: u32,
    height: u32,
    buffer: GpuBuffer<D>,
    pixels: Vec<u8>,
    frames: u64,
}

impl<D: RenderDevice> ReadbackSurface<D> {
    pub fn new(device: &Arc<D>, width: u32, height: u32) -> Result<Self> {
        let size = width as u64 * height as u64 * TextureFormat::Rgba8Unorm.bytes_per_pixel() as u64;
        let buffer = GpuBuffer::new(
            device,
            &BufferDesc {
                name: "readback",
                size,
                heap: HeapKind::Readback,
                purpose: BufferPurpose::Readback,
                allow_unordered_access: false,
                initial_state: ResourceState::CopyDest,
            },
        )?;

        Ok(Self {
            width,
            height,
            buffer,
            pixels: vec![0; size as usize],
            frames: 0,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if self.frames == 0 {
            return Err(anyhow!("No frame has been presented"));
        }

        let image = RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("Readback of {} bytes does not fill the image", self.pixels.len()))?;
        image
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::info!("Saved frame {} to {}", self.frames, path.display());

        Ok(())
    }
}

impl<D: RenderDevice> PresentationSurface<D::CommandList> for ReadbackSurface<D> {
    fn record_copy(&mut self, list: &mut D::CommandList, source: TextureId) -> Result<()> {
        list.copy_texture_to_buffer(source, self.buffer.id());
        Ok(())
    }

    fn present(&mut self) -> Result<()> {
        self.buffer.read(0, &mut self.pixels)?;
        self.frames += 1;
        log::trace!("Read back frame {}", self.frames);

        Ok(())
    }
}
