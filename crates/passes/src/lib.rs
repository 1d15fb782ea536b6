//! Multi-pass GPU compositing: stencil-masked contour rendering and
//! weighted blended order-independent transparency.
//!
//! - `mask_pass`: writes a contour into the stencil buffer, then fills it
//!   with a caller color only where the stencil passed.
//! - `oit_effect`: owns the accumulation/revealage/depth targets, the blend
//!   contract participating pipelines must follow, and the full-screen
//!   resolve that composites the result onto the output.

pub use mask_pass::{
    MASK_DEPTH_STENCIL_FORMAT, MaskPass, MaskPassParams, MaskRenderContext,
};
pub use oit_effect::{
    AccumulationParams, OIT_ACCUMULATION_FORMAT, OIT_DEPTH_FORMAT, OIT_REVEALAGE_FORMAT,
    OitEffect, accumulation_blend_state, accumulation_color_targets, oit_weight_wgsl,
};

mod mask_pass;

mod oit_effect;
