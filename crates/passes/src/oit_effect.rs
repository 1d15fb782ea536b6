//! Weighted blended order-independent transparency.
//!
//! `prepare` sizes the accumulation, revealage, and depth targets to the
//! output and hands back the attachment views plus the blend state every
//! participating pipeline must use. Layers draw into the accumulation pass,
//! then `render` composites the result onto the output with a full-screen
//! strip. Targets survive across frames and are only recreated when the
//! output size changes.

pub const OIT_ACCUMULATION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
pub const OIT_REVEALAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;
pub const OIT_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// WGSL source for the fragment weight functions. Participating shaders
/// append this to their own source before compiling.
pub fn oit_weight_wgsl() -> &'static str {
    include_str!("oit_weight.wgsl")
}

/// Blend state every pipeline drawing into the accumulation pass must use.
/// Color accumulates additively while alpha builds the transmittance
/// product `prod(1 - a_i)` from its initial value of 1.
pub fn accumulation_blend_state() -> wgpu::BlendState {
    wgpu::BlendState {
        color: wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::One,
            operation: wgpu::BlendOperation::Add,
        },
        alpha: wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::Zero,
            dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
            operation: wgpu::BlendOperation::Add,
        },
    }
}

/// Color targets for pipelines drawing into the accumulation pass, in
/// attachment order: accumulation, then revealage.
pub fn accumulation_color_targets() -> [Option<wgpu::ColorTargetState>; 2] {
    [
        Some(wgpu::ColorTargetState {
            format: OIT_ACCUMULATION_FORMAT,
            blend: Some(accumulation_blend_state()),
            write_mask: wgpu::ColorWrites::ALL,
        }),
        Some(wgpu::ColorTargetState {
            format: OIT_REVEALAGE_FORMAT,
            blend: Some(accumulation_blend_state()),
            write_mask: wgpu::ColorWrites::ALL,
        }),
    ]
}

/// Everything a layer needs to draw into the accumulation pass.
pub struct AccumulationParams<'a> {
    pub accumulation_view: &'a wgpu::TextureView,
    pub revealage_view: &'a wgpu::TextureView,
    pub depth_view: &'a wgpu::TextureView,
    pub blend: wgpu::BlendState,
    /// Transparency needs depth ordering resolved by the weights, not the
    /// depth buffer.
    pub depth_write_enabled: bool,
    pub cull_mode: Option<wgpu::Face>,
}

struct OitResources {
    width: u32,
    height: u32,
    accumulation: wgpu::Texture,
    accumulation_view: wgpu::TextureView,
    revealage: wgpu::Texture,
    revealage_view: wgpu::TextureView,
    depth: wgpu::Texture,
    depth_view: wgpu::TextureView,
    resolve_bind_group: wgpu::BindGroup,
}

pub struct OitEffect {
    resolve_bind_group_layout: wgpu::BindGroupLayout,
    resolve_pipeline: wgpu::RenderPipeline,
    resources: Option<OitResources>,
    generation: u64,
}

impl OitEffect {
    pub fn new(device: &wgpu::Device, output_format: wgpu::TextureFormat) -> Self {
        let resolve_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("oit.resolve_layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
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

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("oit.resolve_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("oit_resolve.wgsl").into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("oit.resolve_pipeline_layout"),
            bind_group_layouts: &[&resolve_bind_group_layout],
            immediate_size: 0,
        });
        let resolve_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("oit.resolve"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: output_format,
                    blend: Some(wgpu::BlendState {
                        color: wgpu::BlendComponent {
                            src_factor: wgpu::BlendFactor::One,
                            dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                            operation: wgpu::BlendOperation::Add,
                        },
                        alpha: wgpu::BlendComponent {
                            src_factor: wgpu::BlendFactor::One,
                            dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                            operation: wgpu::BlendOperation::Add,
                        },
                    }),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                ..wgpu::PrimitiveState::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        Self {
            resolve_bind_group_layout,
            resolve_pipeline,
            resources: None,
            generation: 0,
        }
    }

    /// Ensures the offscreen targets match the output size, recreating them
    /// only on resize or after `cleanup`.
    pub fn prepare(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        if self
            .resources
            .as_ref()
            .is_some_and(|r| r.width == width && r.height == height)
        {
            return;
        }
        if let Some(old) = self.resources.take() {
            old.accumulation.destroy();
            old.revealage.destroy();
            old.depth.destroy();
        }
        self.resources = Some(OitResources::new(
            device,
            &self.resolve_bind_group_layout,
            width,
            height,
        ));
        self.generation += 1;
    }

    /// Begins the pass layers accumulate into. Returns `None` before
    /// `prepare` or after `cleanup`.
    pub fn begin_accumulation_pass<'a>(
        &self,
        encoder: &'a mut wgpu::CommandEncoder,
    ) -> Option<wgpu::RenderPass<'a>> {
        let resources = self.resources.as_ref()?;
        Some(encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("passes.oit_accumulation"),
            color_attachments: &[
                // The transmittance product starts at 1, so alpha clears to
                // 1 rather than 0.
                Some(wgpu::RenderPassColorAttachment {
                    view: &resources.accumulation_view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.0,
                            g: 0.0,
                            b: 0.0,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                }),
                Some(wgpu::RenderPassColorAttachment {
                    view: &resources.revealage_view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                }),
            ],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &resources.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        }))
    }

    /// Attachment views and pipeline settings for layers drawing into the
    /// accumulation pass. `None` before `prepare` or after `cleanup`.
    pub fn accumulation_params(&self) -> Option<AccumulationParams<'_>> {
        let resources = self.resources.as_ref()?;
        Some(AccumulationParams {
            accumulation_view: &resources.accumulation_view,
            revealage_view: &resources.revealage_view,
            depth_view: &resources.depth_view,
            blend: accumulation_blend_state(),
            depth_write_enabled: false,
            cull_mode: None,
        })
    }

    /// Composites the accumulated result onto `target_view`, preserving its
    /// existing contents under the transparency. No-op when unprepared.
    pub fn render(&self, encoder: &mut wgpu::CommandEncoder, target_view: &wgpu::TextureView) {
        let Some(resources) = &self.resources else {
            return;
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("passes.oit_resolve"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target_view,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        pass.set_pipeline(&self.resolve_pipeline);
        pass.set_bind_group(0, &resources.resolve_bind_group, &[]);
        pass.draw(0..4, 0..1);
    }

    /// Releases the offscreen targets. Safe to call repeatedly or before
    /// `prepare`; the next `prepare` rebuilds them.
    pub fn cleanup(&mut self) {
        if let Some(resources) = self.resources.take() {
            resources.accumulation.destroy();
            resources.revealage.destroy();
            resources.depth.destroy();
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.resources.is_some()
    }

    /// Counts target (re)creations; unchanged by `prepare` calls that keep
    /// the existing targets.
    pub fn resource_generation(&self) -> u64 {
        self.generation
    }
}

impl OitResources {
    fn new(
        device: &wgpu::Device,
        resolve_layout: &wgpu::BindGroupLayout,
        width: u32,
        height: u32,
    ) -> Self {
        let accumulation = create_target(
            device,
            "oit.accumulation",
            OIT_ACCUMULATION_FORMAT,
            width,
            height,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let revealage = create_target(
            device,
            "oit.revealage",
            OIT_REVEALAGE_FORMAT,
            width,
            height,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let depth = create_target(
            device,
            "oit.depth",
            OIT_DEPTH_FORMAT,
            width,
            height,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        let accumulation_view = accumulation.create_view(&wgpu::TextureViewDescriptor::default());
        let revealage_view = revealage.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());

        let resolve_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("oit.resolve_bind"),
            layout: resolve_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&accumulation_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&revealage_view),
                },
            ],
        });

        Self {
            width,
            height,
            accumulation,
            accumulation_view,
            revealage,
            revealage_view,
            depth,
            depth_view,
            resolve_bind_group,
        }
    }
}

fn create_target(
    device: &wgpu::Device,
    label: &str,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    usage: wgpu::TextureUsages,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    })
}
