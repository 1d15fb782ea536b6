//! Stencil-masked contour render pass.
//!
//! One `render` call walks the contour through three phases inside a single
//! render pass: rasterize the filled contour into the stencil buffer with
//! color and depth writes disabled, optionally draw the contour outline as a
//! visualization aid, then fill the contour again with the caller's color
//! where the stencil equals the write value. The stencil contents are scoped
//! to the call; every render starts from a cleared stencil.

use wgpu::util::DeviceExt;

/// Stencil value written by the mask phase and tested by the fill phase.
const STENCIL_WRITE_VALUE: u32 = 1;

/// Outline color matching the original pass (near-black after the /255 in
/// the shader).
const OUTLINE_COLOR: [f32; 4] = [10.0, 10.0, 10.0, 1.0];

pub const MASK_DEPTH_STENCIL_FORMAT: wgpu::TextureFormat =
    wgpu::TextureFormat::Depth24PlusStencil8;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ContourVertex {
    clip_position: [f32; 2],
}

const CONTOUR_VERTEX_LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
    array_stride: std::mem::size_of::<ContourVertex>() as u64,
    step_mode: wgpu::VertexStepMode::Vertex,
    attributes: &wgpu::vertex_attr_array![0 => Float32x2],
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskPassParams {
    /// Fill color for the masked draw, rgb in 0..255.
    pub color: [f32; 3],
    /// Draw the contour outline between the stencil write and the masked
    /// fill. Visualization aid, not mask logic.
    pub outline: bool,
}

pub struct MaskRenderContext<'a> {
    pub queue: &'a wgpu::Queue,
    pub target_view: &'a wgpu::TextureView,
    /// Must use `MASK_DEPTH_STENCIL_FORMAT`.
    pub depth_stencil_view: &'a wgpu::TextureView,
}

struct MaskModel {
    vertex_buffer: wgpu::Buffer,
    fill_index_buffer: wgpu::Buffer,
    fill_index_count: u32,
    outline_index_buffer: wgpu::Buffer,
    outline_index_count: u32,
    fill_color_buffer: wgpu::Buffer,
    fill_bind_group: wgpu::BindGroup,
    outline_bind_group: wgpu::BindGroup,
    stencil_write_pipeline: wgpu::RenderPipeline,
    outline_pipeline: wgpu::RenderPipeline,
    masked_fill_pipeline: wgpu::RenderPipeline,
}

pub struct MaskPass {
    model: Option<MaskModel>,
}

/// Triangle-list indices for a convex contour drawn as a fan from vertex 0.
pub(crate) fn fan_triangulation_indices(vertex_count: usize) -> Vec<u16> {
    if vertex_count < 3 {
        return Vec::new();
    }
    let mut indices = Vec::with_capacity((vertex_count - 2) * 3);
    for i in 1..vertex_count - 1 {
        indices.extend_from_slice(&[0, i as u16, i as u16 + 1]);
    }
    indices
}

/// Line-strip indices closing the contour back to its first vertex.
pub(crate) fn closed_outline_indices(vertex_count: usize) -> Vec<u16> {
    if vertex_count < 2 {
        return Vec::new();
    }
    let mut indices: Vec<u16> = (0..vertex_count as u16).collect();
    indices.push(0);
    indices
}

impl MaskPass {
    /// Builds the contour model and pipelines. `contour` is given in unit
    /// coordinates and mapped to clip space here.
    pub fn new(
        device: &wgpu::Device,
        target_format: wgpu::TextureFormat,
        contour: &[[f32; 2]],
    ) -> Self {
        Self {
            model: Some(MaskModel::new(device, target_format, contour)),
        }
    }

    pub fn render(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        context: &MaskRenderContext<'_>,
        params: &MaskPassParams,
    ) {
        let Some(model) = &self.model else {
            return;
        };
        let fill_color = [params.color[0], params.color[1], params.color[2], 1.0];
        context
            .queue
            .write_buffer(&model.fill_color_buffer, 0, bytemuck::bytes_of(&fill_color));

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("passes.mask"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: context.target_view,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: context.depth_stencil_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(0),
                    store: wgpu::StoreOp::Store,
                }),
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });

        pass.set_vertex_buffer(0, model.vertex_buffer.slice(..));
        pass.set_stencil_reference(STENCIL_WRITE_VALUE);

        // Phase 1: write the stencil from the filled contour; color and
        // depth stay untouched.
        pass.set_pipeline(&model.stencil_write_pipeline);
        pass.set_bind_group(0, &model.fill_bind_group, &[]);
        pass.set_index_buffer(model.fill_index_buffer.slice(..), wgpu::IndexFormat::Uint16);
        pass.draw_indexed(0..model.fill_index_count, 0, 0..1);

        // Phase 2: optional outline, drawn with depth like an ordinary
        // layer.
        if params.outline {
            pass.set_pipeline(&model.outline_pipeline);
            pass.set_bind_group(0, &model.outline_bind_group, &[]);
            pass.set_index_buffer(
                model.outline_index_buffer.slice(..),
                wgpu::IndexFormat::Uint16,
            );
            pass.draw_indexed(0..model.outline_index_count, 0, 0..1);
        }

        // Phase 3: fill with the caller's color only where the stencil
        // passed; depth test and write disabled.
        pass.set_pipeline(&model.masked_fill_pipeline);
        pass.set_bind_group(0, &model.fill_bind_group, &[]);
        pass.set_index_buffer(model.fill_index_buffer.slice(..), wgpu::IndexFormat::Uint16);
        pass.draw_indexed(0..model.fill_index_count, 0, 0..1);
    }

    /// Releases the contour model's GPU resources. Safe to call repeatedly;
    /// only the first call releases anything.
    pub fn delete(&mut self) {
        self.model = None;
    }

    pub fn is_deleted(&self) -> bool {
        self.model.is_none()
    }
}

impl MaskModel {
    fn new(device: &wgpu::Device, target_format: wgpu::TextureFormat, contour: &[[f32; 2]]) -> Self {
        let vertices: Vec<ContourVertex> = contour
            .iter()
            .map(|point| ContourVertex {
                clip_position: [point[0] * 2.0 - 1.0, point[1] * 2.0 - 1.0],
            })
            .collect();
        let fill_indices = fan_triangulation_indices(vertices.len());
        let outline_indices = closed_outline_indices(vertices.len());

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mask.contour_vertices"),
            contents: bytemuck::cast_slice(&vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let fill_index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mask.fill_indices"),
            contents: bytemuck::cast_slice(&fill_indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        let outline_index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mask.outline_indices"),
            contents: bytemuck::cast_slice(&outline_indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        let fill_color_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mask.fill_color"),
            size: std::mem::size_of::<[f32; 4]>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let outline_color_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mask.outline_color"),
            contents: bytemuck::bytes_of(&OUTLINE_COLOR),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("mask.color_layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let fill_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mask.fill_color_bind"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: fill_color_buffer.as_entire_binding(),
            }],
        });
        let outline_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mask.outline_color_bind"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: outline_color_buffer.as_entire_binding(),
            }],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("mask.contour_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("mask.wgsl").into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("mask.pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let stencil_replace = wgpu::StencilFaceState {
            compare: wgpu::CompareFunction::Always,
            fail_op: wgpu::StencilOperation::Replace,
            depth_fail_op: wgpu::StencilOperation::Replace,
            pass_op: wgpu::StencilOperation::Replace,
        };
        let stencil_write_pipeline =
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("mask.stencil_write"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[CONTOUR_VERTEX_LAYOUT],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: target_format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::empty(),
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: MASK_DEPTH_STENCIL_FORMAT,
                    depth_write_enabled: false,
                    depth_compare: wgpu::CompareFunction::Always,
                    stencil: wgpu::StencilState {
                        front: stencil_replace,
                        back: stencil_replace,
                        read_mask: 0xff,
                        write_mask: 0xff,
                    },
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            });

        let outline_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("mask.outline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[CONTOUR_VERTEX_LAYOUT],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: target_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::LineStrip,
                strip_index_format: Some(wgpu::IndexFormat::Uint16),
                ..wgpu::PrimitiveState::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: MASK_DEPTH_STENCIL_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        let stencil_keep = wgpu::StencilFaceState {
            compare: wgpu::CompareFunction::Equal,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: wgpu::StencilOperation::Keep,
        };
        let masked_fill_pipeline =
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("mask.masked_fill"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[CONTOUR_VERTEX_LAYOUT],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: target_format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: MASK_DEPTH_STENCIL_FORMAT,
                    depth_write_enabled: false,
                    depth_compare: wgpu::CompareFunction::Always,
                    stencil: wgpu::StencilState {
                        front: stencil_keep,
                        back: stencil_keep,
                        read_mask: 0xff,
                        write_mask: 0,
                    },
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            });

        Self {
            vertex_buffer,
            fill_index_buffer,
            fill_index_count: fill_indices.len() as u32,
            outline_index_buffer,
            outline_index_count: outline_indices.len() as u32,
            fill_color_buffer,
            fill_bind_group,
            outline_bind_group,
            stencil_write_pipeline,
            outline_pipeline,
            masked_fill_pipeline,
        }
    }
}
