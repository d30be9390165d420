//! Map layer construction operators

pub mod map_layer;
