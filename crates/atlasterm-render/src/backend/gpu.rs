use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atlasterm_core::U16x2;

use super::{FrameConstants, RenderBackend};
use crate::error::BackendError;
use crate::grid::Cell;
use crate::surface::GlyphSurface;

const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const ATLAS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Where frames go.
pub enum WgpuTarget {
    /// A texture the host can read back or sample; exposed as the surface handle.
    Offscreen,
    /// A window surface created by the host from `instance`.
    Surface {
        instance: wgpu::Instance,
        surface: wgpu::Surface<'static>,
    },
}

struct Gpu {
    device: wgpu::Device,
    queue: wgpu::Queue,
    lost: Arc<AtomicBool>,
    format: wgpu::TextureFormat,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    constants: wgpu::Buffer,
    cells: Option<wgpu::Buffer>,
    atlas: Option<wgpu::Texture>,
    offscreen: Option<wgpu::Texture>,
    bind_group: Option<wgpu::BindGroup>,
}

impl Gpu {
    fn rebind(&mut self) {
        let (Some(cells), Some(atlas)) = (&self.cells, &self.atlas) else {
            self.bind_group = None;
            return;
        };
        let atlas_view = atlas.create_view(&wgpu::TextureViewDescriptor::default());
        self.bind_group = Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("atlasterm_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.constants.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: cells.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&atlas_view),
                },
            ],
        }));
    }
}

/// GPU backend: one full-screen triangle reading a cell storage buffer and the atlas texture.
pub struct WgpuBackend {
    instance: wgpu::Instance,
    surface: Option<wgpu::Surface<'static>>,
    power_preference: wgpu::PowerPreference,
    gpu: Option<Gpu>,
}

impl WgpuBackend {
    pub fn new(target: WgpuTarget) -> Self {
        let (instance, surface) = match target {
            WgpuTarget::Offscreen => (
                wgpu::Instance::new(&wgpu::InstanceDescriptor {
                    backends: wgpu::Backends::all(),
                    ..Default::default()
                }),
                None,
            ),
            WgpuTarget::Surface { instance, surface } => (instance, Some(surface)),
        };
        Self {
            instance,
            surface,
            power_preference: wgpu::PowerPreference::HighPerformance,
            gpu: None,
        }
    }

    pub fn offscreen() -> Self {
        Self::new(WgpuTarget::Offscreen)
    }

    pub fn with_power_preference(mut self, power_preference: wgpu::PowerPreference) -> Self {
        self.power_preference = power_preference;
        self
    }

    fn gpu_mut(&mut self) -> Result<&mut Gpu, BackendError> {
        self.gpu
            .as_mut()
            .ok_or_else(|| BackendError::Backend("wgpu device not created".into()))
    }

    async fn open(&self) -> Result<Gpu, BackendError> {
        let adapter = self
            .instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: self.power_preference,
                compatible_surface: self.surface.as_ref(),
                force_fallback_adapter: false,
            })
            .await
            .map_err(|err| BackendError::Creation {
                what: "wgpu adapter",
                details: err.to_string(),
            })?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("atlasterm"),
                ..Default::default()
            })
            .await
            .map_err(|err| BackendError::Creation {
                what: "wgpu device",
                details: err.to_string(),
            })?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            tracing::warn!(?reason, %message, "wgpu device lost");
            flag.store(true, Ordering::Release);
        });

        let format = match &self.surface {
            Some(surface) => {
                let caps = surface.get_capabilities(&adapter);
                caps.formats
                    .iter()
                    .copied()
                    .find(|f| !f.is_srgb())
                    .or_else(|| caps.formats.first().copied())
                    .ok_or_else(|| BackendError::Creation {
                        what: "surface format",
                        details: "surface reports no supported formats".into(),
                    })?
            }
            None => OFFSCREEN_FORMAT,
        };

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("atlasterm_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shader.wgsl").into()),
        });

        let constants = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("atlasterm_constants"),
            size: std::mem::size_of::<FrameConstants>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("atlasterm_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("atlasterm_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("atlasterm_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        tracing::info!(adapter = ?adapter.get_info().name, ?format, "created wgpu device");
        Ok(Gpu {
            device,
            queue,
            lost,
            format,
            pipeline,
            bind_group_layout,
            constants,
            cells: None,
            atlas: None,
            offscreen: None,
            bind_group: None,
        })
    }
}

impl RenderBackend for WgpuBackend {
    type SurfaceHandle = wgpu::Texture;

    fn create_device(&mut self) -> Result<(), BackendError> {
        self.gpu = None;
        let gpu = pollster::block_on(self.open())?;
        self.gpu = Some(gpu);
        Ok(())
    }

    fn release(&mut self) {
        self.gpu = None;
    }

    fn has_device(&self) -> bool {
        self.gpu.is_some()
    }

    fn max_texture_dimension(&self) -> u32 {
        match &self.gpu {
            Some(gpu) => gpu.device.limits().max_texture_dimension_2d,
            None => wgpu::Limits::downlevel_defaults().max_texture_dimension_2d,
        }
    }

    fn resize(&mut self, size_px: U16x2, cell_count: U16x2) -> Result<(), BackendError> {
        let width = (size_px.x as u32).max(1);
        let height = (size_px.y as u32).max(1);
        let surface = self.surface.as_ref();
        let gpu = self
            .gpu
            .as_mut()
            .ok_or_else(|| BackendError::Backend("wgpu device not created".into()))?;

        match surface {
            Some(surface) => surface.configure(
                &gpu.device,
                &wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format: gpu.format,
                    width,
                    height,
                    present_mode: wgpu::PresentMode::AutoVsync,
                    alpha_mode: wgpu::CompositeAlphaMode::Auto,
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                },
            ),
            None => {
                gpu.offscreen = Some(gpu.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("atlasterm_offscreen"),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: gpu.format,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                }));
            }
        }

        let cells = cell_count.area().max(1);
        gpu.cells = Some(gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("atlasterm_cells"),
            size: (cells * std::mem::size_of::<Cell>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
        gpu.rebind();
        Ok(())
    }

    fn recreate_atlas(&mut self, size_px: U16x2) -> Result<(), BackendError> {
        let gpu = self.gpu_mut()?;
        let limit = gpu.device.limits().max_texture_dimension_2d;
        if size_px.x as u32 > limit || size_px.y as u32 > limit {
            return Err(BackendError::Creation {
                what: "glyph atlas",
                details: format!("{size_px:?} exceeds the {limit}px texture limit"),
            });
        }
        gpu.atlas = Some(gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("atlasterm_atlas"),
            size: wgpu::Extent3d {
                width: (size_px.x as u32).max(1),
                height: (size_px.y as u32).max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: ATLAS_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        }));
        gpu.rebind();
        Ok(())
    }

    fn write_atlas_cell(
        &mut self,
        surface: &GlyphSurface,
        index: usize,
        slot: U16x2,
    ) -> Result<(), BackendError> {
        let gpu = self.gpu_mut()?;
        let atlas = gpu
            .atlas
            .as_ref()
            .ok_or_else(|| BackendError::Backend("atlas written before creation".into()))?;
        let cell = surface.cell_size();
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: atlas,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: slot.x as u32,
                    y: slot.y as u32,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            surface.pixels(),
            wgpu::TexelCopyBufferLayout {
                offset: surface.cell_offset(index) as u64,
                bytes_per_row: Some(surface.bytes_per_row()),
                rows_per_image: Some(cell.y as u32),
            },
            wgpu::Extent3d {
                width: cell.x as u32,
                height: cell.y as u32,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn update_constants(&mut self, constants: &FrameConstants) -> Result<(), BackendError> {
        let gpu = self.gpu_mut()?;
        gpu.queue
            .write_buffer(&gpu.constants, 0, bytemuck::bytes_of(constants));
        Ok(())
    }

    fn upload_cells(&mut self, cells: &[Cell]) -> Result<(), BackendError> {
        let gpu = self.gpu_mut()?;
        let buffer = gpu
            .cells
            .as_ref()
            .ok_or_else(|| BackendError::Backend("cells uploaded before resize".into()))?;
        if !cells.is_empty() {
            gpu.queue.write_buffer(buffer, 0, bytemuck::cast_slice(cells));
        }
        Ok(())
    }

    fn draw_and_present(&mut self) -> Result<(), BackendError> {
        let surface = self.surface.as_ref();
        let gpu = self
            .gpu
            .as_mut()
            .ok_or_else(|| BackendError::Backend("wgpu device not created".into()))?;
        if gpu.lost.load(Ordering::Acquire) {
            return Err(BackendError::DeviceLost("device lost callback fired".into()));
        }
        let bind_group = gpu
            .bind_group
            .as_ref()
            .ok_or_else(|| BackendError::Backend("draw before atlas and cells exist".into()))?;

        let frame = match surface {
            Some(surface) => match surface.get_current_texture() {
                Ok(frame) => Some(frame),
                Err(wgpu::SurfaceError::Lost) => {
                    return Err(BackendError::DeviceLost("surface lost".into()));
                }
                Err(wgpu::SurfaceError::Outdated) | Err(wgpu::SurfaceError::Timeout) => {
                    tracing::debug!("surface not ready, skipping frame");
                    return Ok(());
                }
                Err(err) => return Err(BackendError::Backend(err.to_string())),
            },
            None => None,
        };
        let view = match (&frame, &gpu.offscreen) {
            (Some(frame), _) => frame
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default()),
            (None, Some(offscreen)) => {
                offscreen.create_view(&wgpu::TextureViewDescriptor::default())
            }
            (None, None) => {
                return Err(BackendError::Backend("draw before resize".into()));
            }
        };

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("atlasterm_frame_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("atlasterm_frame_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            pass.set_pipeline(&gpu.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
        if let Some(frame) = frame {
            frame.present();
        }
        Ok(())
    }

    fn surface_handle(&self) -> Option<wgpu::Texture> {
        self.gpu.as_ref()?.offscreen.clone()
    }
}
