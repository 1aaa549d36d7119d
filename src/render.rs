use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytemuck::{bytes_of, Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3};
use wgpu::util::DeviceExt;
use winit::dpi::PhysicalSize;
use winit::window::{Window, WindowId};

use crate::car::EnvironmentMap;
use crate::scene::SceneState;

/// Per-frame camera state consumed by the uniform buffer.
pub struct CameraFrame {
    pub view_proj: Mat4,
    pub inv_view_proj: Mat4,
    pub position: Vec3,
}

/// Tessellated egui output handed to the renderer for painting.
pub struct GuiPrimitives {
    pub textures_delta: egui::TexturesDelta,
    pub primitives: Vec<egui::ClippedPrimitive>,
    pub pixels_per_point: f32,
}

/// A captured frame, rows tightly packed as RGBA8.
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

const SHADOW_MAP_SIZE: u32 = 1024;
const MAX_ENV_MIP_LEVELS: u32 = 6;
const HELPER_SCALE: f32 = 0.2;

/// GPU renderer backed by wgpu that draws the showroom scene and the debug
/// panel on top of it.
pub struct Renderer {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    size: PhysicalSize<u32>,
    depth: DepthBuffer,
    scene_pipeline: wgpu::RenderPipeline,
    background_pipeline: wgpu::RenderPipeline,
    shadow_pipeline: wgpu::RenderPipeline,
    global_buffer: wgpu::Buffer,
    global_bind_group: wgpu::BindGroup,
    object_layout: wgpu::BindGroupLayout,
    env_layout: wgpu::BindGroupLayout,
    env_sampler: wgpu::Sampler,
    env_bind_group: wgpu::BindGroup,
    env_uploaded: bool,
    env_mip_count: f32,
    shadow: ShadowMap,
    ground_mesh: MeshBuffers,
    helper_mesh: MeshBuffers,
    part_meshes: Vec<MeshBuffers>,
    egui_renderer: egui_wgpu::Renderer,
}

impl Renderer {
    /// Initializes the GPU renderer for the provided window.
    pub async fn new(window: Arc<Window>) -> Result<Self> {
        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Err(anyhow!("window has zero area"));
        }

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let surface = instance.create_surface(Arc::clone(&window))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("failed to acquire GPU adapter")?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("viewer-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .context("failed to create GPU device")?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|format| format.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width,
            height: size.height,
            present_mode: wgpu::PresentMode::Fifo,
            desired_maximum_frame_latency: 2,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
        };
        surface.configure(&device, &config);

        let depth = DepthBuffer::create(&device, config.width, config.height);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("viewer-shader"),
            source: wgpu::ShaderSource::Wgsl(SHADER.into()),
        });

        let global_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("global-bind-layout"),
            entries: &[uniform_entry::<GlobalUniform>(0)],
        });
        let object_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("object-bind-layout"),
            entries: &[uniform_entry::<ObjectConstants>(0)],
        });
        let env_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("env-bind-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let shadow_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("shadow-bind-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                    count: None,
                },
            ],
        });

        let scene_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("scene-pipeline-layout"),
            bind_group_layouts: &[&global_layout, &object_layout, &env_layout, &shadow_layout],
            push_constant_ranges: &[],
        });
        let depth_only_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("shadow-pipeline-layout"),
            bind_group_layouts: &[&global_layout, &object_layout],
            push_constant_ranges: &[],
        });

        let vertex_layout = wgpu::VertexBufferLayout {
            array_stride: (6 * std::mem::size_of::<f32>()) as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x3,
                    offset: 0,
                    shader_location: 0,
                },
                wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x3,
                    offset: (3 * std::mem::size_of::<f32>()) as u64,
                    shader_location: 1,
                },
            ],
        };

        let scene_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("scene-pipeline"),
            layout: Some(&scene_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[vertex_layout.clone()],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DepthBuffer::FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: Default::default(),
                bias: Default::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
        });

        let background_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("background-pipeline"),
            layout: Some(&scene_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_background",
                buffers: &[],
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DepthBuffer::FORMAT,
                depth_write_enabled: false,
                depth_compare: wgpu::CompareFunction::Always,
                stencil: Default::default(),
                bias: Default::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_background",
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
        });

        let shadow_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("shadow-pipeline"),
            layout: Some(&depth_only_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_shadow",
                buffers: &[vertex_layout],
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: Some(wgpu::DepthStencilState {
                format: ShadowMap::FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: Default::default(),
                bias: wgpu::DepthBiasState {
                    constant: 2,
                    slope_scale: 2.0,
                    clamp: 0.0,
                },
            }),
            multisample: wgpu::MultisampleState::default(),
            fragment: None,
            multiview: None,
        });

        let global_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("global-uniform"),
            size: std::mem::size_of::<GlobalUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let global_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("global-bind-group"),
            layout: &global_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: global_buffer.as_entire_binding(),
            }],
        });

        let env_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("env-sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        // 1x1 placeholder until the environment image arrives.
        let placeholder = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("env-placeholder"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let env_bind_group = create_env_bind_group(
            &device,
            &env_layout,
            &placeholder.create_view(&wgpu::TextureViewDescriptor::default()),
            &env_sampler,
        );

        let shadow = ShadowMap::create(&device, &shadow_layout);

        let ground_mesh =
            MeshBuffers::from_interleaved(&device, &ground_vertices(), &[0, 1, 2, 0, 2, 3], "ground");
        let helper_mesh = MeshBuffers::from_interleaved(
            &device,
            &helper_cube_vertices(),
            HELPER_CUBE_INDICES,
            "light-helper",
        );

        let egui_renderer = egui_wgpu::Renderer::new(&device, surface_format, None, 1);

        Ok(Self {
            window,
            surface,
            device,
            queue,
            config,
            size,
            depth,
            scene_pipeline,
            background_pipeline,
            shadow_pipeline,
            global_buffer,
            global_bind_group,
            object_layout,
            env_layout,
            env_sampler,
            env_bind_group,
            env_uploaded: false,
            env_mip_count: 0.0,
            shadow,
            ground_mesh,
            helper_mesh,
            part_meshes: Vec::new(),
            egui_renderer,
        })
    }

    pub fn window_id(&self) -> WindowId {
        self.window.id()
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn surface_size(&self) -> PhysicalSize<u32> {
        self.size
    }

    /// Resizes the swap chain and depth buffer to the exact new dimensions.
    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width == 0 || new_size.height == 0 {
            return;
        }
        self.size = new_size;
        self.config.width = new_size.width;
        self.config.height = new_size.height;
        self.surface.configure(&self.device, &self.config);
        self.depth = DepthBuffer::create(&self.device, new_size.width, new_size.height);
    }

    /// Updates the camera, lighting, and background uniforms before a frame.
    pub fn update_globals(&self, scene: &SceneState, camera: &CameraFrame) {
        let light = &scene.spot_light;
        let light_dir = (light.target - light.position).normalize_or_zero();
        let up = if light_dir.y.abs() > 0.99 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let light_view = Mat4::look_at_rh(light.position, light.target, up);
        let light_proj = Mat4::perspective_rh(
            (light.angle * 2.0).min(3.0),
            1.0,
            0.1,
            light.distance,
        );

        let uniform = GlobalUniform {
            view_proj: camera.view_proj.to_cols_array_2d(),
            inv_view_proj: camera.inv_view_proj.to_cols_array_2d(),
            light_view_proj: (light_proj * light_view).to_cols_array_2d(),
            camera_position: camera.position.extend(1.0).into(),
            light_position: light
                .position
                .extend(if scene.shadow_map_enabled { 1.0 } else { 0.0 })
                .into(),
            light_color: light.color.extend(light.intensity).into(),
            light_direction: light_dir.extend(0.0).into(),
            light_params: [
                light.angle.cos(),
                (light.angle * (1.0 - light.penumbra)).cos(),
                light.distance,
                light.decay,
            ],
            background: [
                scene.background.intensity,
                scene.background.blurriness * self.env_mip_count,
                self.env_mip_count,
                0.0,
            ],
        };
        self.queue
            .write_buffer(&self.global_buffer, 0, bytes_of(&uniform));
    }

    /// Draws one frame of the scene with the panel painted on top.
    pub fn render(
        &mut self,
        scene: &SceneState,
        gui: Option<&GuiPrimitives>,
    ) -> Result<(), wgpu::SurfaceError> {
        self.prepare_scene_resources(scene);

        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame-encoder"),
            });

        self.encode_scene_passes(&mut encoder, &view, scene);

        let mut egui_buffers = Vec::new();
        if let Some(gui) = gui {
            let screen = egui_wgpu::ScreenDescriptor {
                size_in_pixels: [self.config.width, self.config.height],
                pixels_per_point: gui.pixels_per_point,
            };
            for (id, delta) in &gui.textures_delta.set {
                self.egui_renderer
                    .update_texture(&self.device, &self.queue, *id, delta);
            }
            egui_buffers = self.egui_renderer.update_buffers(
                &self.device,
                &self.queue,
                &mut encoder,
                &gui.primitives,
                &screen,
            );
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("gui-pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                self.egui_renderer.render(&mut pass, &gui.primitives, &screen);
            }
        }

        self.queue
            .submit(egui_buffers.into_iter().chain(std::iter::once(encoder.finish())));
        output.present();

        if let Some(gui) = gui {
            for id in &gui.textures_delta.free {
                self.egui_renderer.free_texture(id);
            }
        }
        Ok(())
    }

    /// Renders one frame without the panel into an offscreen texture and
    /// reads it back as tightly packed RGBA8 rows.
    pub fn capture(&mut self, scene: &SceneState) -> Result<Screenshot> {
        self.prepare_scene_resources(scene);

        let width = self.config.width;
        let height = self.config.height;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("capture-target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.config.format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("capture-encoder"),
            });
        self.encode_scene_passes(&mut encoder, &view, scene);

        let bytes_per_row = padded_bytes_per_row(width * 4);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("capture-readback"),
            size: bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        slice.map_async(wgpu::MapMode::Read, |_| {});
        self.device.poll(wgpu::Maintain::Wait);

        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks_exact(bytes_per_row as usize) {
                pixels.extend_from_slice(&row[..(width * 4) as usize]);
            }
        }
        buffer.unmap();

        if is_bgra(self.config.format) {
            for pixel in pixels.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
        }
        Ok(Screenshot {
            width,
            height,
            pixels,
        })
    }

    fn prepare_scene_resources(&mut self, scene: &SceneState) {
        if !self.env_uploaded {
            if let Some(env) = scene.environment.as_deref() {
                self.upload_environment(env);
            }
        }
        if self.part_meshes.is_empty() {
            if let Some(model) = scene.model.as_ref() {
                self.part_meshes = model
                    .parts
                    .iter()
                    .enumerate()
                    .map(|(index, part)| {
                        MeshBuffers::from_interleaved(
                            &self.device,
                            &part.vertices,
                            &part.indices,
                            &format!("part-{index}"),
                        )
                    })
                    .collect();
            }
        }
    }

    /// Records the shadow, background, and scene passes for one frame.
    fn encode_scene_passes(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        color_view: &wgpu::TextureView,
        scene: &SceneState,
    ) {
        let draws = self.build_draw_list(scene);

        if scene.shadow_map_enabled && scene.model.is_some() {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("shadow-pass"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.shadow.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.shadow_pipeline);
            pass.set_bind_group(0, &self.global_bind_group, &[]);
            for draw in draws.iter().filter(|draw| draw.casts_shadow) {
                let mesh = self.mesh_for(draw.mesh);
                pass.set_vertex_buffer(0, mesh.vertex.slice(..));
                pass.set_index_buffer(mesh.index.slice(..), wgpu::IndexFormat::Uint32);
                pass.set_bind_group(1, &draw.bind_group, &[]);
                pass.draw_indexed(0..mesh.index_count, 0, 0..1);
            }
        }

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("scene-pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: 0.03,
                        g: 0.03,
                        b: 0.05,
                        a: 1.0,
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth.view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_bind_group(0, &self.global_bind_group, &[]);
        // The ground is always first in the draw list; its bind group keeps
        // group 1 populated for the background draw.
        pass.set_bind_group(1, &draws[0].bind_group, &[]);
        pass.set_bind_group(2, &self.env_bind_group, &[]);
        pass.set_bind_group(3, &self.shadow.bind_group, &[]);

        if scene.background.env.is_some() && self.env_uploaded {
            pass.set_pipeline(&self.background_pipeline);
            pass.draw(0..3, 0..1);
        }

        pass.set_pipeline(&self.scene_pipeline);
        for draw in &draws {
            let mesh = self.mesh_for(draw.mesh);
            pass.set_vertex_buffer(0, mesh.vertex.slice(..));
            pass.set_index_buffer(mesh.index.slice(..), wgpu::IndexFormat::Uint32);
            pass.set_bind_group(1, &draw.bind_group, &[]);
            pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        }
    }

    fn mesh_for(&self, reference: MeshRef) -> &MeshBuffers {
        match reference {
            MeshRef::Ground => &self.ground_mesh,
            MeshRef::Helper => &self.helper_mesh,
            MeshRef::Part(index) => &self.part_meshes[index],
        }
    }

    /// Builds the per-object uniform bind groups for one frame.
    fn build_draw_list(&self, scene: &SceneState) -> Vec<DrawItem> {
        let mut draws = Vec::new();

        let ground = ObjectConstants::new(
            Mat4::IDENTITY,
            scene.ground.color,
            (0.0, 0.8, 0.0, 0.0),
            [
                0.0,
                0.0,
                if scene.ground.receive_shadow { 1.0 } else { 0.0 },
                0.0,
            ],
        );
        draws.push(self.draw_item(MeshRef::Ground, ground, false));

        if let Some(model) = scene.model.as_ref() {
            for (index, part) in model.parts.iter().enumerate() {
                if self.part_meshes.get(index).is_none() {
                    continue;
                }
                let env_enabled = part.env_map.is_some();
                let constants = ObjectConstants::new(
                    part.transform,
                    part.material.color(),
                    part.material.shading(),
                    [
                        part.env_intensity,
                        if env_enabled { 1.0 } else { 0.0 },
                        0.0,
                        0.0,
                    ],
                );
                draws.push(self.draw_item(MeshRef::Part(index), constants, part.cast_shadow));
            }
        }

        if scene.spot_light.helper_visible {
            let model = Mat4::from_translation(scene.spot_light.position)
                * Mat4::from_scale(Vec3::splat(HELPER_SCALE));
            // env.w marks the helper as unlit.
            let constants =
                ObjectConstants::new(model, scene.spot_light.color, (0.0, 1.0, 0.0, 0.0), [
                    0.0, 0.0, 0.0, 1.0,
                ]);
            draws.push(self.draw_item(MeshRef::Helper, constants, false));
        }

        draws
    }

    fn draw_item(&self, mesh: MeshRef, constants: ObjectConstants, casts_shadow: bool) -> DrawItem {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("object-uniform"),
                contents: bytes_of(&constants),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("object-bind-group"),
            layout: &self.object_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });
        DrawItem {
            mesh,
            bind_group,
            casts_shadow,
        }
    }

    fn upload_environment(&mut self, env: &EnvironmentMap) {
        let mips = build_env_mips(env, MAX_ENV_MIP_LEVELS);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("environment-map"),
            size: wgpu::Extent3d {
                width: env.width,
                height: env.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mips.len() as u32,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        for (level, mip) in mips.iter().enumerate() {
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: level as u32,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                bytemuck::cast_slice(&mip.texels),
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(mip.width * 8),
                    rows_per_image: Some(mip.height),
                },
                wgpu::Extent3d {
                    width: mip.width,
                    height: mip.height,
                    depth_or_array_layers: 1,
                },
            );
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.env_bind_group =
            create_env_bind_group(&self.device, &self.env_layout, &view, &self.env_sampler);
        self.env_mip_count = mips.len().saturating_sub(1) as f32;
        self.env_uploaded = true;
    }
}

#[derive(Clone, Copy)]
enum MeshRef {
    Ground,
    Helper,
    Part(usize),
}

struct DrawItem {
    mesh: MeshRef,
    bind_group: wgpu::BindGroup,
    casts_shadow: bool,
}

fn uniform_entry<T>(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<T>() as u64),
        },
        count: None,
    }
}

fn create_env_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    view: &wgpu::TextureView,
    sampler: &wgpu::Sampler,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("env-bind-group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(sampler),
            },
        ],
    })
}

fn is_bgra(format: wgpu::TextureFormat) -> bool {
    matches!(
        format,
        wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb
    )
}

/// Smallest multiple of the copy alignment that fits one row.
fn padded_bytes_per_row(unpadded: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

struct MeshBuffers {
    vertex: wgpu::Buffer,
    index: wgpu::Buffer,
    index_count: u32,
}

impl MeshBuffers {
    fn from_interleaved(
        device: &wgpu::Device,
        vertices: &[f32],
        indices: &[u32],
        label: &str,
    ) -> Self {
        let vertex = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label}-vertices")),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label}-indices")),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self {
            vertex,
            index,
            index_count: indices.len() as u32,
        }
    }
}

struct DepthBuffer {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl DepthBuffer {
    const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24Plus;

    fn create(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("depth-texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            _texture: texture,
            view,
        }
    }
}

struct ShadowMap {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    bind_group: wgpu::BindGroup,
}

impl ShadowMap {
    const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

    fn create(device: &wgpu::Device, layout: &wgpu::BindGroupLayout) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("shadow-map"),
            size: wgpu::Extent3d {
                width: SHADOW_MAP_SIZE,
                height: SHADOW_MAP_SIZE,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("shadow-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("shadow-bind-group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });
        Self {
            _texture: texture,
            view,
            bind_group,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GlobalUniform {
    view_proj: [[f32; 4]; 4],
    inv_view_proj: [[f32; 4]; 4],
    light_view_proj: [[f32; 4]; 4],
    camera_position: [f32; 4],
    /// xyz position; w carries the global shadow flag.
    light_position: [f32; 4],
    /// rgb color; w carries the intensity.
    light_color: [f32; 4],
    light_direction: [f32; 4],
    /// cone cosine, penumbra cosine, distance, decay.
    light_params: [f32; 4],
    /// background intensity, blur lod, env mip count.
    background: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ObjectConstants {
    model: [[f32; 4]; 4],
    normal: [[f32; 4]; 3],
    color: [f32; 4],
    /// metalness, roughness, clear coat, clear coat roughness.
    material: [f32; 4],
    /// env intensity, env enabled, receives shadow, unlit.
    env: [f32; 4],
}

impl ObjectConstants {
    fn new(model: Mat4, color: Vec3, shading: (f32, f32, f32, f32), env: [f32; 4]) -> Self {
        let normal = Mat3::from_mat4(model).inverse().transpose();
        Self {
            model: model.to_cols_array_2d(),
            normal: mat3_to_3x4(normal),
            color: color.extend(1.0).into(),
            material: [shading.0, shading.1, shading.2, shading.3],
            env,
        }
    }
}

fn mat3_to_3x4(matrix: Mat3) -> [[f32; 4]; 3] {
    let cols = matrix.to_cols_array();
    [
        [cols[0], cols[1], cols[2], 0.0],
        [cols[3], cols[4], cols[5], 0.0],
        [cols[6], cols[7], cols[8], 0.0],
    ]
}

fn ground_vertices() -> Vec<f32> {
    let half = crate::scene::GROUND_SIZE / 2.0;
    let mut vertices = Vec::with_capacity(24);
    for (x, z) in [(-half, -half), (half, -half), (half, half), (-half, half)] {
        vertices.extend_from_slice(&[x, 0.0, z, 0.0, 1.0, 0.0]);
    }
    vertices
}

fn helper_cube_vertices() -> Vec<f32> {
    let mut vertices = Vec::with_capacity(8 * 6);
    for index in 0..8u32 {
        let x = if index & 1 != 0 { 0.5 } else { -0.5 };
        let y = if index & 2 != 0 { 0.5 } else { -0.5 };
        let z = if index & 4 != 0 { 0.5 } else { -0.5 };
        let inv = 1.0 / 3f32.sqrt();
        vertices.extend_from_slice(&[x, y, z, x * 2.0 * inv, y * 2.0 * inv, z * 2.0 * inv]);
    }
    vertices
}

const HELPER_CUBE_INDICES: &[u32] = &[
    0, 1, 3, 0, 3, 2, // back
    4, 6, 7, 4, 7, 5, // front
    0, 2, 6, 0, 6, 4, // left
    1, 5, 7, 1, 7, 3, // right
    0, 4, 5, 0, 5, 1, // bottom
    2, 3, 7, 2, 7, 6, // top
];

/// One mip level of the environment texture, RGBA float16 texels.
struct EnvMip {
    width: u32,
    height: u32,
    texels: Vec<u16>,
}

/// Builds a box-filtered mip chain so that background blur and rough
/// reflections can pick a level.
fn build_env_mips(env: &EnvironmentMap, max_levels: u32) -> Vec<EnvMip> {
    let mut mips = Vec::new();
    let mut width = env.width.max(1);
    let mut height = env.height.max(1);
    let mut rgb = env.pixels.clone();

    loop {
        let mut texels = Vec::with_capacity((width * height * 4) as usize);
        for pixel in rgb.chunks_exact(3) {
            texels.push(f32_to_f16_bits(pixel[0]));
            texels.push(f32_to_f16_bits(pixel[1]));
            texels.push(f32_to_f16_bits(pixel[2]));
            texels.push(f32_to_f16_bits(1.0));
        }
        mips.push(EnvMip {
            width,
            height,
            texels,
        });

        if mips.len() as u32 >= max_levels || (width <= 1 && height <= 1) {
            break;
        }
        let next_width = (width / 2).max(1);
        let next_height = (height / 2).max(1);
        rgb = downsample_rgb(&rgb, width, height, next_width, next_height);
        width = next_width;
        height = next_height;
    }
    mips
}

fn downsample_rgb(rgb: &[f32], width: u32, height: u32, next_width: u32, next_height: u32) -> Vec<f32> {
    let mut out = Vec::with_capacity((next_width * next_height * 3) as usize);
    for y in 0..next_height {
        for x in 0..next_width {
            let x0 = (x * 2).min(width - 1);
            let x1 = (x * 2 + 1).min(width - 1);
            let y0 = (y * 2).min(height - 1);
            let y1 = (y * 2 + 1).min(height - 1);
            for channel in 0..3 {
                let sample = |sx: u32, sy: u32| rgb[((sy * width + sx) * 3 + channel) as usize];
                out.push(
                    (sample(x0, y0) + sample(x1, y0) + sample(x0, y1) + sample(x1, y1)) / 4.0,
                );
            }
        }
    }
    out
}

/// Truncating f32 to f16 conversion, sufficient for HDR texel upload.
fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;
    if exp == 255 {
        // Infinity and NaN.
        return sign | 0x7c00 | u16::from(mantissa != 0);
    }
    let exp = exp - 127 + 15;
    if exp >= 31 {
        return sign | 0x7c00;
    }
    if exp <= 0 {
        if exp < -10 {
            return sign;
        }
        let mantissa = mantissa | 0x0080_0000;
        return sign | (mantissa >> (14 - exp)) as u16;
    }
    sign | ((exp as u16) << 10) | (mantissa >> 13) as u16
}

const SHADER: &str = r#"
const PI: f32 = 3.14159265;
const TAU: f32 = 6.2831853;

struct Globals {
    view_proj: mat4x4<f32>,
    inv_view_proj: mat4x4<f32>,
    light_view_proj: mat4x4<f32>,
    camera_position: vec4<f32>,
    light_position: vec4<f32>,
    light_color: vec4<f32>,
    light_direction: vec4<f32>,
    light_params: vec4<f32>,
    background: vec4<f32>,
}

struct ObjectConstants {
    model: mat4x4<f32>,
    normal: mat3x4<f32>,
    color: vec4<f32>,
    material: vec4<f32>,
    env: vec4<f32>,
}

@group(0) @binding(0)
var<uniform> globals: Globals;

@group(1) @binding(0)
var<uniform> object: ObjectConstants;

@group(2) @binding(0)
var env_texture: texture_2d<f32>;
@group(2) @binding(1)
var env_sampler: sampler;

@group(3) @binding(0)
var shadow_texture: texture_depth_2d;
@group(3) @binding(1)
var shadow_sampler: sampler_comparison;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) world_pos: vec3<f32>,
    @location(1) normal: vec3<f32>,
}

fn sample_env(direction: vec3<f32>, lod: f32) -> vec3<f32> {
    let dir = normalize(direction);
    let u = atan2(dir.x, dir.z) / TAU + 0.5;
    let v = acos(clamp(dir.y, -1.0, 1.0)) / PI;
    return textureSampleLevel(env_texture, env_sampler, vec2<f32>(u, v), lod).rgb;
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let world_position = object.model * vec4<f32>(input.position, 1.0);
    out.position = globals.view_proj * world_position;
    out.world_pos = world_position.xyz;
    let world_normal = mat3x3<f32>(
        object.normal[0].xyz,
        object.normal[1].xyz,
        object.normal[2].xyz
    ) * input.normal;
    out.normal = normalize(world_normal);
    return out;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    if (object.env.w > 0.5) {
        // Unlit helper geometry.
        return vec4<f32>(object.color.rgb, object.color.a);
    }

    var normal = normalize(input.normal);
    let view_dir = normalize(globals.camera_position.xyz - input.world_pos);
    if (dot(normal, view_dir) < 0.0) {
        normal = -normal;
    }

    let to_light = globals.light_position.xyz - input.world_pos;
    let light_dist = length(to_light);
    let light_dir = to_light / max(light_dist, 1e-4);

    let angle_cos = dot(globals.light_direction.xyz, -light_dir);
    let spot = smoothstep(globals.light_params.x, globals.light_params.y, angle_cos);
    let range = max(1.0 - light_dist / globals.light_params.z, 0.0);
    let attenuation = spot * pow(range, globals.light_params.w) * globals.light_color.w;

    var shadow = 1.0;
    if (globals.light_position.w > 0.5 && object.env.z > 0.5) {
        let light_space = globals.light_view_proj * vec4<f32>(input.world_pos, 1.0);
        let proj = light_space.xyz / light_space.w;
        let uv = vec2<f32>(proj.x * 0.5 + 0.5, 0.5 - proj.y * 0.5);
        if (all(uv >= vec2<f32>(0.0)) && all(uv <= vec2<f32>(1.0)) && proj.z <= 1.0) {
            shadow = textureSampleCompareLevel(shadow_texture, shadow_sampler, uv, proj.z - 0.002);
        }
    }

    let base = object.color.rgb;
    let metalness = object.material.x;
    let roughness = object.material.y;

    let diffuse = max(dot(normal, light_dir), 0.0) * (1.0 - metalness);
    let halfway = normalize(light_dir + view_dir);
    let spec_power = exp2(10.0 * (1.0 - roughness) + 1.0);
    let spec_strength = mix(0.04, 1.0, metalness);
    let specular = pow(max(dot(normal, halfway), 0.0), spec_power) * spec_strength;
    let direct = (base * diffuse + vec3<f32>(specular)) * globals.light_color.rgb;

    var color = base * 0.03 + direct * attenuation * shadow;

    let fresnel = pow(1.0 - max(dot(normal, view_dir), 0.0), 5.0);
    let mip_count = globals.background.z;
    if (object.env.y > 0.5) {
        let reflection = reflect(-view_dir, normal);
        let env_color = sample_env(reflection, roughness * mip_count) * object.env.x;
        let reflectance = mix(vec3<f32>(0.04), base, metalness);
        color += env_color * (reflectance + (vec3<f32>(1.0) - reflectance) * fresnel);

        let clear_coat = object.material.z;
        if (clear_coat > 0.0) {
            let coat_lod = object.material.w * mip_count;
            let coat = sample_env(reflection, coat_lod) * object.env.x;
            color += coat * clear_coat * (0.04 + 0.96 * fresnel);
        }
    }

    return vec4<f32>(color, object.color.a);
}

@vertex
fn vs_shadow(input: VertexInput) -> @builtin(position) vec4<f32> {
    return globals.light_view_proj * object.model * vec4<f32>(input.position, 1.0);
}

struct BackgroundOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) ndc: vec2<f32>,
}

@vertex
fn vs_background(@builtin(vertex_index) index: u32) -> BackgroundOutput {
    var out: BackgroundOutput;
    let x = f32((index << 1u) & 2u) * 2.0 - 1.0;
    let y = f32(index & 2u) * 2.0 - 1.0;
    out.position = vec4<f32>(x, y, 1.0, 1.0);
    out.ndc = vec2<f32>(x, y);
    return out;
}

@fragment
fn fs_background(input: BackgroundOutput) -> @location(0) vec4<f32> {
    let far = globals.inv_view_proj * vec4<f32>(input.ndc, 1.0, 1.0);
    let dir = far.xyz / far.w - globals.camera_position.xyz;
    let color = sample_env(dir, globals.background.y) * globals.background.x;
    return vec4<f32>(color, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_padded_to_the_copy_alignment() {
        assert_eq!(padded_bytes_per_row(256), 256);
        assert_eq!(padded_bytes_per_row(3200), 3328); // 800 px * 4 bytes
        assert_eq!(padded_bytes_per_row(1), 256);
    }

    #[test]
    fn f16_conversion_hits_known_values() {
        assert_eq!(f32_to_f16_bits(0.0), 0x0000);
        assert_eq!(f32_to_f16_bits(1.0), 0x3c00);
        assert_eq!(f32_to_f16_bits(0.5), 0x3800);
        assert_eq!(f32_to_f16_bits(-2.0), 0xc000);
        assert_eq!(f32_to_f16_bits(f32::INFINITY), 0x7c00);
        assert_eq!(f32_to_f16_bits(100000.0), 0x7c00); // overflow clamps to inf
    }

    #[test]
    fn mip_chain_halves_until_capped() {
        let env = EnvironmentMap {
            width: 8,
            height: 4,
            pixels: vec![1.0; 8 * 4 * 3],
        };
        let mips = build_env_mips(&env, 6);
        assert_eq!(mips.len(), 4); // 8x4, 4x2, 2x1, 1x1
        assert_eq!((mips[0].width, mips[0].height), (8, 4));
        assert_eq!((mips[3].width, mips[3].height), (1, 1));
        // A constant image stays constant through the box filter.
        assert!(mips[3].texels[..3]
            .iter()
            .all(|&bits| bits == f32_to_f16_bits(1.0)));
    }

    #[test]
    fn mip_chain_respects_the_level_cap() {
        let env = EnvironmentMap {
            width: 1024,
            height: 512,
            pixels: vec![0.5; 1024 * 512 * 3],
        };
        let mips = build_env_mips(&env, MAX_ENV_MIP_LEVELS);
        assert_eq!(mips.len(), MAX_ENV_MIP_LEVELS as usize);
        assert_eq!((mips[5].width, mips[5].height), (32, 16));
    }
}
