//! Value transform operators

pub mod color_ramp;
pub mod math;
